//! Runner configuration.
//!
//! `overseer.toml` is resolved from `--config`, the `OVERSEER_CONFIG`
//! environment variable, or the current directory. The managed root is
//! derived once at startup: when the operator supplies an override, the
//! actual managed directory is always the well-known subdirectory nested
//! inside it, never the override itself, so cleanup can never touch an
//! arbitrary user directory.

use std::collections::HashMap;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Well-known subdirectory nested under the operator-supplied root.
pub const MANAGED_SUBDIR: &str = "overseer-workspaces";

pub const DEFAULT_CONFIG_FILE: &str = "overseer.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    pub device: DeviceSection,
    /// Operator override for where workspaces live. The managed root is
    /// `<managed_root>/overseer-workspaces`.
    #[serde(default)]
    pub managed_root: Option<PathBuf>,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub process: ProcessSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// Named coding-agent executor profiles.
    #[serde(default)]
    pub executors: HashMap<String, ExecutorProfile>,
    #[serde(default)]
    pub default_executor: Option<String>,
    /// Git host CLI used by the open_pr / attach_pr operations.
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            device: DeviceSection::default(),
            managed_root: None,
            lease: LeaseSection::default(),
            process: ProcessSection::default(),
            archive: ArchiveSection::default(),
            retry: RetrySection::default(),
            executors: HashMap::new(),
            default_executor: None,
            host_cli: default_host_cli(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    pub id: String,
    /// Base64-encoded HMAC key shared with the control plane at enrollment.
    pub key: String,
    #[serde(default)]
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseSection {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl LeaseSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Heartbeat cadence is at most a third of the TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.ttl_secs / 3).max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSection {
    /// Grace period between the cancel signal and SIGKILL.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    #[serde(default = "default_log_ring_bytes")]
    pub log_ring_bytes: usize,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            cancel_grace_secs: default_cancel_grace_secs(),
            log_ring_bytes: default_log_ring_bytes(),
        }
    }
}

impl ProcessSection {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSection {
    /// Archiving a workspace retains worktrees unless this opts into
    /// removal; either way the choice is explicit and reversible.
    #[serde(default)]
    pub remove_worktrees: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
        }
    }
}

impl RetrySection {
    pub fn budget(&self) -> overseer_common::error::RetryBudget {
        overseer_common::error::RetryBudget {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// How to launch a coding agent; the prompt goes to stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorProfile {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_host_cli() -> String {
    "gh".to_string()
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_log_ring_bytes() -> usize {
    256 * 1024
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    8_000
}

/// Load configuration from the first of: explicit path, `OVERSEER_CONFIG`,
/// `./overseer.toml`.
pub fn load(explicit: Option<&Path>) -> Result<RunnerConfig> {
    let path = explicit
        .map(PathBuf::from)
        .or_else(|| env::var_os("OVERSEER_CONFIG").map(PathBuf::from))
        .or_else(|| {
            let candidate = env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
            candidate.is_file().then_some(candidate)
        });

    let Some(path) = path else {
        bail!("no configuration found: pass --config or create {DEFAULT_CONFIG_FILE}");
    };

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: RunnerConfig =
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;

    if config.device.id.trim().is_empty() {
        bail!("config {}: device.id must not be empty", path.display());
    }
    if config.device.key.trim().is_empty() {
        bail!("config {}: device.key must not be empty", path.display());
    }
    Ok(config)
}

/// Resolve and create the managed root. The override (or the default under
/// the user's home) is only ever the *parent*; the managed directory is the
/// nested well-known subdirectory.
pub fn resolve_managed_root(config: &RunnerConfig) -> io::Result<PathBuf> {
    let base = match &config.managed_root {
        Some(root) => root.clone(),
        None => {
            let home = env::var("HOME").map_err(|_| {
                io::Error::new(io::ErrorKind::NotFound, "HOME environment variable missing")
            })?;
            PathBuf::from(home).join(".overseer")
        }
    };

    let root = base.join(MANAGED_SUBDIR);
    std::fs::create_dir_all(&root)?;
    let canonical = root.canonicalize()?;

    // Refuse degenerate roots that would make the prefix guard vacuous.
    if canonical.parent().is_none() || canonical == Path::new("/") {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "managed root resolves to the filesystem root",
        ));
    }
    Ok(canonical)
}

/// Per-repo run scripts, read from `.overseer/run.toml` inside a worktree.
/// Absent file means no scripts are configured.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RepoScripts {
    #[serde(default)]
    pub setup: Vec<SetupScript>,
    #[serde(default)]
    pub cleanup: Option<String>,
    #[serde(default)]
    pub archive: Option<String>,
    #[serde(default)]
    pub dev_server: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupScript {
    pub name: String,
    pub run: String,
    #[serde(default)]
    pub parallel: bool,
}

impl RepoScripts {
    pub const FILE: &'static str = ".overseer/run.toml";

    pub fn load(worktree: &Path) -> Result<Self> {
        let path = worktree.join(Self::FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    /// Setup actions run in parallel with the coding action only when every
    /// configured script opts in.
    pub fn setup_is_parallel(&self) -> bool {
        !self.setup.is_empty() && self.setup.iter().all(|s| s.parallel)
    }

    pub fn setup_script(&self, name: &str) -> Option<&SetupScript> {
        self.setup.iter().find(|s| s.name == name)
    }
}
