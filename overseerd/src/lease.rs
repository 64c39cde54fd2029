//! Execution leases.
//!
//! A runner may only drive an execution while it holds the lease. The
//! guard heartbeats in the background at a third of the TTL; dropping it
//! (or an explicit release) stops the heartbeat. Losing the lease is not
//! recovered from: the orphan sweep owns the `dropped` transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use overseer_common::error::{RunnerError, RunnerResult};
use overseer_store::{ControlPlaneStore, StoreError};

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn ControlPlaneStore>,
    device_id: String,
    ttl: Duration,
    heartbeat_interval: Duration,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        device_id: String,
        ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            device_id,
            ttl,
            heartbeat_interval,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Atomically claim the execution. `AlreadyLeased` means another runner
    /// owns it; the caller simply returns without treating it as an error.
    pub async fn acquire(&self, execution_id: Uuid) -> RunnerResult<LeaseGuard> {
        match self
            .store
            .acquire_lease(execution_id, &self.device_id, self.ttl)
            .await
        {
            Ok(_) => {}
            Err(StoreError::AlreadyLeased { device_id, .. }) => {
                return Err(RunnerError::AlreadyLeased {
                    execution_id,
                    device_id,
                });
            }
            Err(err) => {
                return Err(RunnerError::transient(format!("acquire lease: {err}")));
            }
        }

        debug!(execution_id = %execution_id, "lease acquired");
        let heartbeat = spawn_heartbeat(
            self.store.clone(),
            execution_id,
            self.device_id.clone(),
            self.ttl,
            self.heartbeat_interval,
        );
        Ok(LeaseGuard {
            store: self.store.clone(),
            execution_id,
            device_id: self.device_id.clone(),
            heartbeat,
        })
    }
}

fn spawn_heartbeat(
    store: Arc<dyn ControlPlaneStore>,
    execution_id: Uuid,
    device_id: String,
    ttl: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            match store.heartbeat_lease(execution_id, &device_id, ttl).await {
                Ok(()) => {}
                Err(StoreError::AlreadyLeased { .. }) | Err(StoreError::NotFound { .. }) => {
                    // Lease lost or released; the sweep owns what follows.
                    warn!(execution_id = %execution_id, "lease heartbeat lost ownership");
                    break;
                }
                Err(err) => {
                    warn!(execution_id = %execution_id, "lease heartbeat failed: {err}");
                }
            }
        }
    })
}

/// Held for the lifetime of a supervised execution.
pub struct LeaseGuard {
    store: Arc<dyn ControlPlaneStore>,
    execution_id: Uuid,
    device_id: String,
    heartbeat: JoinHandle<()>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("execution_id", &self.execution_id)
            .field("device_id", &self.device_id)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl LeaseGuard {
    /// Stop heartbeating and release. The terminal status transition also
    /// releases store-side, so this is a belt-and-braces no-op then.
    pub async fn release(self) {
        self.heartbeat.abort();
        if let Err(err) = self
            .store
            .release_lease(self.execution_id, &self.device_id)
            .await
        {
            warn!(execution_id = %self.execution_id, "lease release failed: {err}");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_common::types::{RepoSpec, RunReason};
    use overseer_store::{CreateWorkspace, MemoryStore};
    use std::path::PathBuf;

    async fn seeded_execution(store: &Arc<dyn ControlPlaneStore>) -> Uuid {
        let (ws, session) = store
            .create_workspace(CreateWorkspace {
                owner: "u".into(),
                org: None,
                project: None,
                name: "W".into(),
                branch: "feat/z".into(),
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
        store
            .start_execution(ws.id, session.id, RunReason::CodingAgent, None)
            .await
            .unwrap()
            .id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_device_is_rejected_while_fresh() {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let execution_id = seeded_execution(&store).await;

        let mgr_a = LeaseManager::new(
            store.clone(),
            "dev-a".into(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        let mgr_b = LeaseManager::new(
            store.clone(),
            "dev-b".into(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );

        let guard = mgr_a.acquire(execution_id).await.unwrap();
        let err = mgr_b.acquire(execution_id).await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyLeased { .. }));

        guard.release().await;
        // After release the other device can claim.
        mgr_b.acquire(execution_id).await.unwrap().release().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeat_keeps_lease_fresh() {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let execution_id = seeded_execution(&store).await;

        let mgr = LeaseManager::new(
            store.clone(),
            "dev-a".into(),
            Duration::from_millis(300),
            Duration::from_millis(50),
        );
        let guard = mgr.acquire(execution_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let lease = store.get_lease(execution_id).await.unwrap().unwrap();
        assert!(
            !lease.is_expired(chrono::Utc::now()),
            "heartbeat must outpace the TTL"
        );
        guard.release().await;
    }
}
