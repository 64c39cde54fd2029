//! Worktree lifecycle under the managed root.
//!
//! Every workspace repo is materialised as a git worktree at
//! `<managed_root>/<workspace_id>/<repo_name>`, sharing the object store of
//! the source clone. Mutations serialize per (workspace, repo); different
//! pairs proceed in parallel. Every path is canonicalised and prefix-checked
//! against the managed root before anything on disk is touched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use overseer_common::error::{RetryBudget, RunnerError, RunnerResult};
use overseer_common::types::{Workspace, WorkspaceRepo};

use crate::git;
use crate::process_utils::canonicalize_within_root;

type PairLock = Arc<Mutex<()>>;

pub struct WorktreeManager {
    root: PathBuf,
    budget: RetryBudget,
    locks: Mutex<HashMap<(Uuid, Uuid), PairLock>>,
}

impl WorktreeManager {
    /// `root` must already be the canonical managed root. The budget bounds
    /// retries of transient git failures (lock contention).
    pub fn new(root: PathBuf, budget: RetryBudget) -> Self {
        Self {
            root,
            budget,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn managed_root(&self) -> &Path {
        &self.root
    }

    /// Resolve the worktree path for a repo, guarded against escapes.
    pub fn worktree_path(&self, workspace_id: Uuid, repo: &WorkspaceRepo) -> RunnerResult<PathBuf> {
        self.guarded(&format!("{}/{}", workspace_id, repo.repo_name))
    }

    fn guarded(&self, relative: &str) -> RunnerResult<PathBuf> {
        canonicalize_within_root(&self.root, Path::new(relative)).map_err(|_| {
            RunnerError::UnsafePath {
                path: self.root.join(relative),
                root: self.root.clone(),
            }
        })
    }

    /// One lock per (workspace, repo) pair. Locks are taken one at a time,
    /// never two from the same caller.
    async fn pair_lock(&self, workspace_id: Uuid, repo_id: Uuid) -> PairLock {
        let mut locks = self.locks.lock().await;
        locks
            .entry((workspace_id, repo_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotently materialise the worktree for `repo` on the workspace
    /// branch. An existing worktree on the expected branch is returned as
    /// is; anything stale is torn down and recreated cleanly. On failure no
    /// partial worktree remains and the caller may retry.
    pub async fn ensure_worktree(
        &self,
        workspace: &Workspace,
        repo: &WorkspaceRepo,
    ) -> RunnerResult<PathBuf> {
        let lock = self.pair_lock(workspace.id, repo.id).await;
        let _guard = lock.lock().await;

        let path = self.worktree_path(workspace.id, repo)?;

        // Transient git failures (another process holding a lock) are
        // retried with backoff until the budget is spent.
        let mut attempt = 0;
        loop {
            let branch = workspace.branch.clone();
            let target = repo.target_branch.clone();
            let source = repo.source_path.clone();
            let repo_name = repo.repo_name.clone();
            let path = path.clone();
            let result = task::spawn_blocking(move || {
                ensure_worktree_blocking(&source, &path, &branch, &target, &repo_name)
            })
            .await
            .map_err(|e| RunnerError::fatal(format!("worktree task panicked: {e}")))?;

            match result {
                Err(err) if err.is_retryable() => match self.budget.delay_for(attempt) {
                    Some(delay) => {
                        warn!(
                            repo = %repo.repo_name,
                            attempt,
                            "transient worktree failure, retrying: {err}"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(RunnerError::fatal(format!(
                            "retry budget exhausted creating worktree: {err}"
                        )))
                    }
                },
                other => return other,
            }
        }
    }

    /// Remove one repo's worktree and its git metadata.
    pub async fn remove_worktree(
        &self,
        workspace: &Workspace,
        repo: &WorkspaceRepo,
    ) -> RunnerResult<()> {
        let lock = self.pair_lock(workspace.id, repo.id).await;
        let _guard = lock.lock().await;

        let path = self.worktree_path(workspace.id, repo)?;
        let source = repo.source_path.clone();
        task::spawn_blocking(move || remove_worktree_blocking(&source, &path))
            .await
            .map_err(|e| RunnerError::fatal(format!("worktree task panicked: {e}")))?
    }

    /// Remove the whole workspace directory. Repo worktrees must be
    /// detached via [`Self::remove_worktree`] first so git metadata stays
    /// consistent; this deletes whatever remains under the guarded path.
    pub async fn remove_workspace(&self, workspace_id: Uuid) -> RunnerResult<()> {
        let dir = self.guarded(&workspace_id.to_string())?;
        if !dir.exists() {
            return Ok(());
        }
        info!(workspace_id = %workspace_id, path = %dir.display(), "removing workspace directory");
        task::spawn_blocking(move || {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| RunnerError::io(format!("remove {}", dir.display()), e))
        })
        .await
        .map_err(|e| RunnerError::fatal(format!("remove task panicked: {e}")))?
    }
}

fn ensure_worktree_blocking(
    source: &Path,
    path: &Path,
    branch: &str,
    target: &str,
    repo_name: &str,
) -> RunnerResult<PathBuf> {
    if !source.join(".git").exists() {
        return Err(RunnerError::fatal(format!(
            "source repo for '{repo_name}' not found at {}",
            source.display()
        )));
    }

    if path.exists() {
        match git::current_branch(path) {
            Ok(current) if current == branch => {
                debug!(repo = repo_name, "worktree already on expected branch");
                return Ok(path.to_path_buf());
            }
            Ok(current) => {
                warn!(
                    repo = repo_name,
                    expected = branch,
                    found = %current,
                    "stale worktree branch, recreating"
                );
            }
            Err(_) => {
                warn!(repo = repo_name, "unreadable worktree, recreating");
            }
        }
        remove_worktree_blocking(source, path)?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RunnerError::io(format!("create {}", parent.display()), e))?;
    }

    let result = if git::branch_exists(source, branch)? {
        // Reusing an existing branch from a previous materialisation; it
        // must not be checked out anywhere else.
        git::git(
            source,
            &["worktree", "add", &path.to_string_lossy(), branch],
        )
    } else {
        git::git(
            source,
            &[
                "worktree",
                "add",
                "-b",
                branch,
                &path.to_string_lossy(),
                target,
            ],
        )
    };

    match result {
        Ok(_) => Ok(path.to_path_buf()),
        Err(err) => {
            // Leave no partial state behind so the caller can retry.
            let _ = remove_worktree_blocking(source, path);
            if let RunnerError::Fatal { context } = &err {
                if context.contains("already checked out") {
                    return Err(RunnerError::BranchConflict {
                        branch: branch.to_string(),
                        reason: "branch is checked out in another worktree".into(),
                    });
                }
            }
            Err(err)
        }
    }
}

fn remove_worktree_blocking(source: &Path, path: &Path) -> RunnerResult<()> {
    if path.exists() {
        // Ask git first so its worktree metadata is cleaned up; fall back
        // to a plain delete for directories git no longer knows about.
        let removed = git::git(
            source,
            &["worktree", "remove", "--force", &path.to_string_lossy()],
        );
        if removed.is_err() && path.exists() {
            std::fs::remove_dir_all(path)
                .map_err(|e| RunnerError::io(format!("remove {}", path.display()), e))?;
        }
    }
    let _ = git::git(source, &["worktree", "prune"]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn init_source(dir: &Path) {
        git::git(dir, &["init", "--initial-branch", "main"]).unwrap();
        git::git(dir, &["config", "user.email", "t@example.com"]).unwrap();
        git::git(dir, &["config", "user.name", "T"]).unwrap();
        fs::write(dir.join("a.txt"), "a\n").unwrap();
        git::git(dir, &["add", "."]).unwrap();
        git::git(dir, &["commit", "-m", "init"]).unwrap();
    }

    fn fixtures(root: &Path, source: &Path) -> (Workspace, WorkspaceRepo, WorktreeManager) {
        let workspace = Workspace {
            id: Uuid::new_v4(),
            owner: "u".into(),
            org: None,
            project: None,
            name: "W1".into(),
            branch: "feat/x".into(),
            status: overseer_common::types::SessionStatus::Idle,
            archived: false,
            pinned: false,
            active_session_id: None,
            active_workspace_repo_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let repo = WorkspaceRepo {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            repo_id: "host/app".into(),
            repo_name: "app".into(),
            target_branch: "main".into(),
            source_path: source.to_path_buf(),
            enabled: true,
            sort_order: 0,
        };
        let manager = WorktreeManager::new(root.canonicalize().unwrap(), RetryBudget::default());
        (workspace, repo, manager)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ensure_is_idempotent() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        init_source(source.path());
        let (ws, repo, manager) = fixtures(root.path(), source.path());

        let first = manager.ensure_worktree(&ws, &repo).await.unwrap();
        assert!(first.join("a.txt").exists());
        assert_eq!(git::current_branch(&first).unwrap(), "feat/x");

        let second = manager.ensure_worktree(&ws, &repo).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_ensures_serialize_per_pair() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        init_source(source.path());
        let (ws, repo, manager) = fixtures(root.path(), source.path());
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let ws = ws.clone();
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                manager.ensure_worktree(&ws, &repo).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(
            git::current_branch(&manager.worktree_path(ws.id, &repo).unwrap()).unwrap(),
            "feat/x"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_worktree_then_workspace() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        init_source(source.path());
        let (ws, repo, manager) = fixtures(root.path(), source.path());

        let path = manager.ensure_worktree(&ws, &repo).await.unwrap();
        assert!(path.exists());

        manager.remove_worktree(&ws, &repo).await.unwrap();
        assert!(!path.exists());

        manager.remove_workspace(ws.id).await.unwrap();
        assert!(!manager.managed_root().join(ws.id.to_string()).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn escaping_repo_name_is_unsafe() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        init_source(source.path());
        let (ws, mut repo, manager) = fixtures(root.path(), source.path());
        repo.repo_name = "../../escape".into();

        let err = manager.ensure_worktree(&ws, &repo).await.unwrap_err();
        assert!(matches!(err, RunnerError::UnsafePath { .. }));
    }
}
