//! Approval broker.
//!
//! Requesting an approval is synchronous from the execution's point of
//! view: the execution stays `running` while its approval is pending, and
//! the broker resolves once a human (or the expiry reaper) has decided.
//! Expiry counts as a rejection for every chain decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;

use overseer_common::error::{RunnerError, RunnerResult};
use overseer_common::types::{Approval, ApprovalStatus};
use overseer_store::{ApprovalRequest, ControlPlaneStore, StoreEvent};

const POLL_FALLBACK: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ApprovalBroker {
    store: Arc<dyn ControlPlaneStore>,
}

impl ApprovalBroker {
    pub fn new(store: Arc<dyn ControlPlaneStore>) -> Self {
        Self { store }
    }

    pub async fn request(
        &self,
        workspace_id: Uuid,
        session_id: Uuid,
        execution_id: Uuid,
        kind: impl Into<String>,
        prompt: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> RunnerResult<Approval> {
        self.store
            .request_approval(ApprovalRequest {
                workspace_id,
                session_id,
                execution_id,
                kind: kind.into(),
                prompt: prompt.into(),
                expires_at,
            })
            .await
            .map_err(|e| RunnerError::transient(format!("request approval: {e}")))
    }

    /// Wait until the approval leaves `pending`. Listens on the change feed
    /// with a poll fallback for missed events.
    pub async fn await_resolution(&self, approval_id: Uuid) -> RunnerResult<Approval> {
        let mut events = self.store.subscribe();
        loop {
            let current = self
                .store
                .get_approval(approval_id)
                .await
                .map_err(|e| RunnerError::transient(format!("approval lookup: {e}")))?;
            if current.status != ApprovalStatus::Pending {
                debug!(approval_id = %approval_id, status = ?current.status, "approval resolved");
                return Ok(current);
            }

            match tokio::time::timeout(POLL_FALLBACK, events.recv()).await {
                Ok(Ok(StoreEvent::ApprovalUpdated(approval))) if approval.id == approval_id => {
                    if approval.status != ApprovalStatus::Pending {
                        return Ok(approval);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) | Err(_) => {
                    // Fall through to the polling re-check.
                }
            }
        }
    }

    /// Resolve every pending approval of an execution. Returns the first
    /// denial encountered, if any.
    pub async fn resolve_all_for_execution(
        &self,
        execution_id: Uuid,
    ) -> RunnerResult<Option<Approval>> {
        loop {
            let pending = self
                .store
                .pending_approvals_for_execution(execution_id)
                .await
                .map_err(|e| RunnerError::transient(format!("pending approvals: {e}")))?;
            let Some(next) = pending.into_iter().next() else {
                return Ok(None);
            };
            let resolved = self.await_resolution(next.id).await?;
            if resolved.status.is_denial() {
                return Ok(Some(resolved));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_common::types::{RepoSpec, RunReason, SessionStatus};
    use overseer_store::{CreateWorkspace, MemoryStore};
    use std::path::PathBuf;

    async fn seeded() -> (Arc<dyn ControlPlaneStore>, Uuid, Uuid, Uuid) {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let (ws, session) = store
            .create_workspace(CreateWorkspace {
                owner: "u".into(),
                org: None,
                project: None,
                name: "W".into(),
                branch: "feat/a".into(),
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
        (store, ws.id, session.id, exec.id)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolution_after_human_response() {
        let (store, ws, session, exec) = seeded().await;
        let broker = ApprovalBroker::new(store.clone());
        let approval = broker
            .request(ws, session, exec, "dangerous_write", "allow?", None)
            .await
            .unwrap();
        assert_eq!(
            store.get_session(session).await.unwrap().status,
            SessionStatus::NeedsAttention
        );

        let store_clone = store.clone();
        let approval_id = approval.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store_clone
                .respond_approval(approval_id, ApprovalStatus::Rejected, "user-1".into())
                .await
                .unwrap();
        });

        let resolved = broker.await_resolution(approval.id).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Rejected);
        assert!(resolved.status.is_denial());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expiry_resolves_as_denial() {
        let (store, ws, session, exec) = seeded().await;
        let broker = ApprovalBroker::new(store.clone());
        let approval = broker
            .request(
                ws,
                session,
                exec,
                "dangerous_write",
                "allow?",
                Some(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();

        store.expire_approvals(Utc::now()).await.unwrap();
        let resolved = broker.await_resolution(approval.id).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Expired);

        let denial = broker.resolve_all_for_execution(exec).await.unwrap();
        assert!(denial.is_none(), "already resolved approvals do not block");
    }
}
