//! Overseer runner daemon.
//!
//! Converts execution intents from the control plane into idempotent local
//! actions: worktrees under the managed root, supervised typed processes,
//! HEAD snapshots, durable approvals and follow-up queue, lease-owned
//! executions that reconcile after a crash.

use overseerd::{config, recovery};

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use overseer_common::types::DeviceEnrollment;
use overseer_store::sweep::{spawn_approval_reaper, spawn_orphan_sweep};
use overseer_store::{ControlPlaneStore, MemoryStore, StoreEvent};

use overseerd::dispatch::DispatchClient;
use overseerd::lease::LeaseManager;
use overseerd::orchestrator::Orchestrator;
use overseerd::supervisor::Supervisor;
use overseerd::worktree::WorktreeManager;

// Exit codes of the runner binary.
const EXIT_FATAL_CONFIG: u8 = 64;
const EXIT_UNSAFE_ROOT: u8 = 65;
const EXIT_NOT_ENROLLED: u8 = 69;
const EXIT_INTERNAL: u8 = 70;

const DISPATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);
const NONCE_LRU_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "overseerd", version)]
#[command(about = "Overseer workspace execution runner")]
struct Cli {
    /// Path to overseer.toml (or set OVERSEER_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the managed-root parent directory
    #[arg(long)]
    managed_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            return ExitCode::from(EXIT_FATAL_CONFIG);
        }
    };
    if cli.managed_root.is_some() {
        config.managed_root = cli.managed_root.clone();
    }

    let managed_root = match config::resolve_managed_root(&config) {
        Ok(root) => root,
        Err(err) => {
            error!("unsafe managed root: {err}");
            return ExitCode::from(EXIT_UNSAFE_ROOT);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to start runtime: {err}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    match runtime.block_on(run_daemon(config, managed_root)) {
        Ok(code) => code,
        Err(err) => {
            error!("internal error: {err:#}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn run_daemon(config: config::RunnerConfig, managed_root: PathBuf) -> Result<ExitCode> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %config.device.id,
        root = %managed_root.display(),
        "overseerd starting"
    );

    let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());

    // Embedded store starts empty: enroll this device from local identity.
    // Against a shared control plane the enrollment must already exist.
    match store.get_device(&config.device.id).await {
        Ok(Some(enrollment)) if enrollment.is_revoked() => {
            error!(device = %config.device.id, "device enrollment is revoked");
            return Ok(ExitCode::from(EXIT_NOT_ENROLLED));
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            store
                .enroll_device(DeviceEnrollment {
                    device_id: config.device.id.clone(),
                    owning_principal: config
                        .device
                        .principal
                        .clone()
                        .unwrap_or_else(|| "local-operator".to_string()),
                    public_key: config.device.key.clone(),
                    revoked_at: None,
                })
                .await
                .context("enroll device")?;
            info!(device = %config.device.id, "device enrolled with embedded store");
        }
        Err(err) => {
            error!("device lookup failed: {err}");
            return Ok(ExitCode::from(EXIT_NOT_ENROLLED));
        }
    }

    let config = Arc::new(config);
    let worktrees = Arc::new(WorktreeManager::new(
        managed_root.clone(),
        config.retry.budget(),
    ));
    let supervisor = Arc::new(Supervisor::new(
        managed_root.clone(),
        config.process.cancel_grace(),
    ));
    let leases = LeaseManager::new(
        store.clone(),
        config.device.id.clone(),
        config.lease.ttl(),
        config.lease.heartbeat_interval(),
    );
    let dispatch = Arc::new(DispatchClient::new(
        store.clone(),
        config.device.id.clone(),
        &config.device.key,
        NONCE_LRU_CAPACITY,
    )?);
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        worktrees,
        supervisor.clone(),
        leases.clone(),
        config.clone(),
    ));

    // Control-plane-side jobs (embedded here alongside the runner).
    spawn_orphan_sweep(store.clone(), config.lease.sweep_interval());
    spawn_approval_reaper(store.clone(), config.lease.sweep_interval());

    // Reconcile anything this device still owned when it last stopped.
    let report =
        recovery::reconcile_on_startup(store.clone(), supervisor.registry(), &leases).await?;
    if !report.resumed.is_empty() || !report.finalized.is_empty() {
        info!(
            resumed = report.resumed.len(),
            finalized = report.finalized.len(),
            "startup reconciliation done"
        );
    }

    orchestrator.spawn_workspace_watcher();
    spawn_dispatch_loop(store.clone(), dispatch, orchestrator);

    info!("overseerd ready at {}", Utc::now().to_rfc3339());
    wait_for_shutdown().await;
    info!("overseerd shutting down");
    Ok(ExitCode::SUCCESS)
}

/// Poll the intent mailbox, nudged early by submission events.
fn spawn_dispatch_loop(
    store: Arc<dyn ControlPlaneStore>,
    dispatch: Arc<DispatchClient>,
    orchestrator: Arc<Orchestrator>,
) {
    tokio::spawn(async move {
        let mut events = store.subscribe();
        loop {
            match dispatch.poll_once().await {
                Ok(intents) => {
                    for intent in intents {
                        let orchestrator = orchestrator.clone();
                        tokio::spawn(async move {
                            let execution_id = intent.execution_id;
                            if let Err(err) = orchestrator.handle_intent(intent).await {
                                warn!(execution_id = %execution_id, "intent handling failed: {err}");
                            }
                        });
                    }
                }
                Err(err) => warn!("dispatch poll failed: {err}"),
            }

            // Wake on a submission for this device or on the poll interval.
            let sleep = tokio::time::sleep(DISPATCH_POLL_INTERVAL);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    event = events.recv() => match event {
                        Ok(StoreEvent::IntentSubmitted { target_device_id })
                            if target_device_id == dispatch.device_id() => break,
                        Ok(_) => continue,
                        Err(_) => break,
                    },
                }
            }
        }
    });
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("received Ctrl+C"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
