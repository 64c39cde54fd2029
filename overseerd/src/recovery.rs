//! Startup reconciliation after a runner crash or restart.
//!
//! For every non-terminal execution whose lease this device still holds,
//! the process registry decides the outcome: a live, tick-verified pid is
//! resumed (heartbeat continues, a watcher finalizes when it exits); a
//! dead or unknown pid is finalized as `killed`. Executions the orphan
//! sweep already dropped are terminal by now and are never re-dispatched.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use overseer_common::error::RunnerResult;
use overseer_common::types::{ExecutionStatus, RunReason};
use overseer_store::ControlPlaneStore;

use crate::lease::LeaseManager;
use crate::process_registry::{validate_process, Registry};
use crate::process_utils::process_exists;

const RESUME_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub resumed: Vec<Uuid>,
    pub finalized: Vec<Uuid>,
}

pub async fn reconcile_on_startup(
    store: Arc<dyn ControlPlaneStore>,
    registry: Arc<Mutex<Registry>>,
    leases: &LeaseManager,
) -> RunnerResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let owned = store
        .executions_leased_by(leases.device_id())
        .await
        .map_err(|e| overseer_common::error::RunnerError::transient(format!("store: {e}")))?;

    for execution in owned {
        let record = registry.lock().await.get(execution.id).cloned();
        let alive = record.as_ref().map(validate_process).unwrap_or(false);

        if let (true, Some(record)) = (alive, record) {
            info!(
                execution_id = %execution.id,
                pid = record.pid,
                "resuming supervision of surviving process"
            );
            report.resumed.push(execution.id);

            let guard = match leases.acquire(execution.id).await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(execution_id = %execution.id, "could not re-acquire lease: {err}");
                    continue;
                }
            };
            let store = store.clone();
            let pid = record.pid;
            tokio::spawn(async move {
                // The child was re-parented during the restart, so its exit
                // code is unobservable; all we can do is wait for the pid.
                while process_exists(pid) {
                    tokio::time::sleep(RESUME_POLL).await;
                }
                let _ = store
                    .set_execution_status(
                        execution.id,
                        ExecutionStatus::Failed,
                        Some("exit status unknown after runner restart".to_string()),
                    )
                    .await;
                guard.release().await;
            });
        } else {
            info!(execution_id = %execution.id, "finalizing execution without a live process");
            let applied = store
                .set_execution_status(
                    execution.id,
                    ExecutionStatus::Killed,
                    Some("recovered after runner restart".to_string()),
                )
                .await
                .map_err(|e| {
                    overseer_common::error::RunnerError::transient(format!("store: {e}"))
                })?;
            if applied {
                report.finalized.push(execution.id);
                if execution.run_reason == RunReason::CodingAgent {
                    let _ = store.discard_queued_message(execution.session_id).await;
                }
            }
            let _ = store.release_lease(execution.id, leases.device_id()).await;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_registry::{ProcessRecord, ProcessStatus};
    use chrono::Utc;
    use overseer_common::types::RepoSpec;
    use overseer_store::{CreateWorkspace, MemoryStore};
    use std::path::PathBuf;

    async fn seeded(store: &Arc<dyn ControlPlaneStore>) -> (Uuid, Uuid, Uuid) {
        let (ws, session) = store
            .create_workspace(CreateWorkspace {
                owner: "u".into(),
                org: None,
                project: None,
                name: "W".into(),
                branch: "feat/r".into(),
                repos: vec![RepoSpec {
                    repo_id: "host/app".into(),
                    repo_name: "app".into(),
                    target_branch: "main".into(),
                    source_path: PathBuf::from("/srv/git/app"),
                    enabled: true,
                    sort_order: 0,
                }],
                initial_session_title: None,
            })
            .await
            .unwrap();
        let exec = store
            .start_execution(ws.id, session.id, RunReason::CodingAgent, None)
            .await
            .unwrap();
        (ws.id, session.id, exec.id)
    }

    fn lease_manager(store: Arc<dyn ControlPlaneStore>) -> LeaseManager {
        LeaseManager::new(
            store,
            "dev-1".into(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dead_process_finalizes_as_killed_and_discards_queue() {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let (_ws, session, exec) = seeded(&store).await;
        store
            .enqueue_follow_up(session, "stale follow-up".into(), None, None, None)
            .await
            .unwrap();
        let leases = lease_manager(store.clone());
        store
            .acquire_lease(exec, "dev-1", Duration::from_secs(30))
            .await
            .unwrap();

        // Registry knows a pid that no longer exists.
        let registry = Arc::new(Mutex::new(Registry::new()));
        registry.lock().await.insert(ProcessRecord {
            execution_id: exec,
            pid: u32::MAX - 2,
            start_ticks: 1,
            started_at: Utc::now(),
            command: "agent".into(),
            status: ProcessStatus::Running,
            exit_code: None,
        });

        let report = reconcile_on_startup(store.clone(), registry, &leases)
            .await
            .unwrap();
        assert_eq!(report.finalized, vec![exec]);
        assert!(report.resumed.is_empty());

        let execution = store.get_execution(exec).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Killed);
        assert_eq!(
            execution.error_message.as_deref(),
            Some("recovered after runner restart")
        );
        assert!(!execution.queued_follow_up_consumed);
        assert!(store.get_queue_status(session).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminal_executions_are_not_touched() {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let (_ws, _session, exec) = seeded(&store).await;
        store
            .set_execution_status(exec, ExecutionStatus::Dropped, None)
            .await
            .unwrap();

        let leases = lease_manager(store.clone());
        let registry = Arc::new(Mutex::new(Registry::new()));
        let report = reconcile_on_startup(store.clone(), registry, &leases)
            .await
            .unwrap();
        // Lease was released with the terminal transition, so the execution
        // is not even listed.
        assert!(report.finalized.is_empty());
        assert!(report.resumed.is_empty());
        assert_eq!(
            store.get_execution(exec).await.unwrap().status,
            ExecutionStatus::Dropped
        );
    }
}
