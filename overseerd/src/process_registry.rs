//! Durable registry of processes the supervisor has spawned.
//!
//! Persisted with flock + write-temp + fsync + atomic rename so a crashed
//! runner can verify on restart whether the agent process of a `running`
//! execution is still alive, without being fooled by pid reuse (records
//! carry `/proc` start ticks).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

use crate::process_utils::{process_exists, read_proc_stat};

const REGISTRY_FILE: &str = "process_registry.json";
const REGISTRY_LOCK: &str = "process_registry.lock";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub execution_id: Uuid,
    pub pid: u32,
    pub start_ticks: u64,
    pub started_at: DateTime<Utc>,
    pub command: String,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Registry {
    pub processes: HashMap<Uuid, ProcessRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ProcessRecord) {
        self.processes.insert(record.execution_id, record);
    }

    pub fn get(&self, execution_id: Uuid) -> Option<&ProcessRecord> {
        self.processes.get(&execution_id)
    }

    pub fn mark_exited(&mut self, execution_id: Uuid, exit_code: Option<i32>) {
        if let Some(record) = self.processes.get_mut(&execution_id) {
            record.status = ProcessStatus::Exited;
            record.exit_code = exit_code;
        }
    }

    pub fn remove(&mut self, execution_id: Uuid) -> Option<ProcessRecord> {
        self.processes.remove(&execution_id)
    }
}

/// Registry files live in a state directory next to the worktrees, under
/// the managed root.
pub fn state_dir(managed_root: &Path) -> PathBuf {
    managed_root.join(".state")
}

fn registry_path(managed_root: &Path) -> PathBuf {
    state_dir(managed_root).join(REGISTRY_FILE)
}

fn lock_path(managed_root: &Path) -> PathBuf {
    state_dir(managed_root).join(REGISTRY_LOCK)
}

pub fn load_registry(managed_root: &Path) -> io::Result<Registry> {
    let path = registry_path(managed_root);
    if !path.exists() {
        return Ok(Registry::new());
    }

    let file = File::open(&path)?;
    let registry: Registry = serde_json::from_reader(file).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("failed to parse registry {}: {err}", path.display()),
        )
    })?;
    Ok(registry)
}

/// Persist with durable semantics: flock, temp write, fsync, atomic rename,
/// directory fsync.
pub fn save_registry(managed_root: &Path, registry: &Registry) -> io::Result<()> {
    let dir = state_dir(managed_root);
    std::fs::create_dir_all(&dir)?;

    let lock = File::create(lock_path(managed_root))?;
    lock.lock_exclusive()?;

    let temp_path = dir.join(format!("{REGISTRY_FILE}.tmp"));
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);
    let mut temp = options.open(&temp_path)?;

    serde_json::to_writer_pretty(&mut temp, registry).map_err(|err| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("failed to serialise registry: {err}"),
        )
    })?;
    temp.sync_all()?;
    drop(temp);

    std::fs::rename(&temp_path, registry_path(managed_root))?;
    let dir_handle = File::open(&dir)?;
    dir_handle.sync_all()?;

    drop(lock);
    Ok(())
}

/// A record is only trusted when the pid exists *and* the start ticks still
/// match; otherwise the pid was reused.
pub fn validate_process(record: &ProcessRecord) -> bool {
    if record.status != ProcessStatus::Running || !process_exists(record.pid) {
        return false;
    }
    match read_proc_stat(record.pid) {
        Ok(stat) => stat.starttime == record.start_ticks,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(pid: u32, ticks: u64) -> ProcessRecord {
        ProcessRecord {
            execution_id: Uuid::new_v4(),
            pid,
            start_ticks: ticks,
            started_at: Utc::now(),
            command: "sleep 1".into(),
            status: ProcessStatus::Running,
            exit_code: None,
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut registry = Registry::new();
        let rec = record(12345, 42);
        let id = rec.execution_id;
        registry.insert(rec);
        registry.mark_exited(id, Some(0));

        save_registry(tmp.path(), &registry).unwrap();
        let loaded = load_registry(tmp.path()).unwrap();
        let got = loaded.get(id).unwrap();
        assert_eq!(got.status, ProcessStatus::Exited);
        assert_eq!(got.exit_code, Some(0));
    }

    #[test]
    fn missing_registry_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_registry(tmp.path()).unwrap().processes.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn stale_ticks_fail_validation() {
        let pid = std::process::id();
        let ticks = read_proc_stat(pid).unwrap().starttime;

        let live = record(pid, ticks);
        assert!(validate_process(&live));

        let reused = record(pid, ticks + 1);
        assert!(!validate_process(&reused));

        let gone = record(u32::MAX - 1, 1);
        assert!(!validate_process(&gone));
    }
}
