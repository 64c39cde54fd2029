//! Repository HEAD snapshots around an execution.
//!
//! `record_before` runs before any action that may mutate repo state,
//! `record_after` after terminal exit. Both are idempotent upserts keyed by
//! (execution, repo); the captured commits are what makes session reset
//! deterministic.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task;
use tracing::debug;
use uuid::Uuid;

use overseer_common::error::{RunnerError, RunnerResult};
use overseer_common::types::WorkspaceRepo;
use overseer_store::{ControlPlaneStore, RepoStatePatch};

use crate::git;

async fn head_of(path: PathBuf) -> RunnerResult<String> {
    task::spawn_blocking(move || git::head_commit(&path))
        .await
        .map_err(|e| RunnerError::fatal(format!("snapshot task panicked: {e}")))?
}

/// Capture `before_head_commit` for every repo. Existing values are
/// overwritten with the fresh HEAD; re-running before any mutation is
/// harmless.
pub async fn record_before(
    store: &Arc<dyn ControlPlaneStore>,
    execution_id: Uuid,
    repos: &[(WorkspaceRepo, PathBuf)],
) -> RunnerResult<()> {
    for (repo, path) in repos {
        let head = head_of(path.clone()).await?;
        debug!(execution_id = %execution_id, repo = %repo.repo_name, head = %head, "before snapshot");
        store
            .upsert_execution_repo_state(
                execution_id,
                repo.id,
                RepoStatePatch {
                    before_head_commit: Some(head),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RunnerError::fatal(format!("record before snapshot: {e}")))?;
    }
    Ok(())
}

/// Capture `after_head_commit` for every repo once the execution is
/// terminal.
pub async fn record_after(
    store: &Arc<dyn ControlPlaneStore>,
    execution_id: Uuid,
    repos: &[(WorkspaceRepo, PathBuf)],
) -> RunnerResult<()> {
    for (repo, path) in repos {
        let head = head_of(path.clone()).await?;
        debug!(execution_id = %execution_id, repo = %repo.repo_name, head = %head, "after snapshot");
        store
            .upsert_execution_repo_state(
                execution_id,
                repo.id,
                RepoStatePatch {
                    after_head_commit: Some(head),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RunnerError::fatal(format!("record after snapshot: {e}")))?;
    }
    Ok(())
}
