//! Control-plane-side periodic jobs.
//!
//! The orphan sweep reclaims executions whose runner stopped heartbeating,
//! and the approval reaper expires pending approvals past their deadline.
//! Both run against the store contract, so any driver gets them for free.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::ControlPlaneStore;

/// Spawn the orphan sweep loop. Executions with an expired lease and a
/// non-terminal status are marked `dropped`; the runner never does this
/// itself.
pub fn spawn_orphan_sweep(store: Arc<dyn ControlPlaneStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.sweep_orphans(Utc::now()).await {
                Ok(dropped) if !dropped.is_empty() => {
                    info!(count = dropped.len(), "orphan sweep dropped executions");
                }
                Ok(_) => {}
                Err(err) => warn!("orphan sweep failed: {err}"),
            }
        }
    });
}

/// Spawn the approval expiry reaper. An expired approval is equivalent to a
/// rejection for chain decisions.
pub fn spawn_approval_reaper(store: Arc<dyn ControlPlaneStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.expire_approvals(Utc::now()).await {
                Ok(expired) if !expired.is_empty() => {
                    info!(count = expired.len(), "expired pending approvals");
                }
                Ok(_) => {}
                Err(err) => warn!("approval reaper failed: {err}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApprovalRequest, CreateWorkspace, MemoryStore};
    use overseer_common::types::{ApprovalStatus, RepoSpec, RunReason, SessionStatus};
    use std::path::PathBuf;

    #[tokio::test]
    async fn reaper_expires_overdue_approvals() {
        let store = MemoryStore::new();
        let (ws, session) = store
            .create_workspace(CreateWorkspace {
                owner: "user-1".into(),
                org: None,
                project: None,
                name: "W".into(),
                branch: "feat/y".into(),
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
        let approval = store
            .request_approval(ApprovalRequest {
                workspace_id: ws.id,
                session_id: session.id,
                execution_id: exec.id,
                kind: "dangerous_write".into(),
                prompt: "ok?".into(),
                expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            })
            .await
            .unwrap();

        let expired = store.expire_approvals(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, approval.id);
        assert_eq!(
            store.get_approval(approval.id).await.unwrap().status,
            ApprovalStatus::Expired
        );
        // Override lifted; the still-running execution projects `running`.
        assert_eq!(
            store.get_session(session.id).await.unwrap().status,
            SessionStatus::Running
        );
    }
}
