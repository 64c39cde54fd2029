//! Execution orchestration.
//!
//! Drives the per-execution state machine (one terminal transition, ever)
//! and the action chain around it: sequential or parallel setup scripts
//! ahead of the coding agent, cleanup after, follow-up consumption from the
//! single-slot queue, and deterministic session reset from recorded HEAD
//! snapshots. Worktree locks are never held across a store call: locks are
//! taken inside the worktree manager per operation, results posted after.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use overseer_common::envelope::{CodingAgentParams, CommandKind, CommandParams, ExecutionIntent};
use overseer_common::error::{RunnerError, RunnerResult};
use overseer_common::types::{
    ExecutionProcess, ExecutionStatus, RunReason, Session, Workspace, WorkspaceRepo,
};
use overseer_store::{ControlPlaneStore, StoreEvent};

use crate::approval::ApprovalBroker;
use crate::config::{RepoScripts, RunnerConfig};
use crate::git;
use crate::journal::ExecutionJournal;
use crate::lease::LeaseManager;
use crate::snapshot;
use crate::supervisor::{plan_operation, ExitOutcome, OperationPlan, Supervisor};
use crate::worktree::WorktreeManager;

const SETUP_STAMP: &str = ".setup-complete";

fn store_err(err: overseer_store::StoreError) -> RunnerError {
    RunnerError::transient(format!("store: {err}"))
}

pub struct Orchestrator {
    store: Arc<dyn ControlPlaneStore>,
    worktrees: Arc<WorktreeManager>,
    supervisor: Arc<Supervisor>,
    leases: LeaseManager,
    approvals: ApprovalBroker,
    config: Arc<RunnerConfig>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        worktrees: Arc<WorktreeManager>,
        supervisor: Arc<Supervisor>,
        leases: LeaseManager,
        config: Arc<RunnerConfig>,
    ) -> Self {
        let approvals = ApprovalBroker::new(store.clone());
        Self {
            store,
            worktrees,
            supervisor,
            leases,
            approvals,
            config,
        }
    }

    pub fn approvals(&self) -> &ApprovalBroker {
        &self.approvals
    }

    /// Entry point for a validated intent. A terminal execution is never
    /// re-dispatched; `AlreadyLeased` means another runner owns it and is
    /// not an error here.
    pub async fn handle_intent(self: &Arc<Self>, intent: ExecutionIntent) -> RunnerResult<()> {
        let params = CommandParams::validate(intent.command_kind, &intent.params)?;
        let execution = self
            .store
            .get_execution(intent.execution_id)
            .await
            .map_err(store_err)?;
        if execution.status.is_terminal() {
            info!(execution_id = %execution.id, "intent for terminal execution ignored");
            return Ok(());
        }
        self.run_action(execution, intent.command_kind, params).await
    }

    /// Boxed recursion entry used when an action chains into another.
    fn run_action_boxed(
        self: Arc<Self>,
        execution: ExecutionProcess,
        kind: CommandKind,
        params: CommandParams,
    ) -> Pin<Box<dyn Future<Output = RunnerResult<()>> + Send>> {
        Box::pin(async move { self.run_action(execution, kind, params).await })
    }

    fn spawn_action(self: &Arc<Self>, execution: ExecutionProcess, kind: CommandKind, params: CommandParams) {
        let this = self.clone();
        tokio::spawn(async move {
            let execution_id = execution.id;
            if let Err(err) = this.run_action_boxed(execution, kind, params).await {
                warn!(execution_id = %execution_id, "chained action failed: {err}");
            }
        });
    }

    /// The full action path: lease, claim, worktrees, snapshots, setup
    /// chain, supervised run, approval gate, terminal transition, and the
    /// post-terminal chain decisions.
    async fn run_action(
        self: &Arc<Self>,
        execution: ExecutionProcess,
        kind: CommandKind,
        params: CommandParams,
    ) -> RunnerResult<()> {
        let guard = match self.leases.acquire(execution.id).await {
            Ok(guard) => guard,
            Err(RunnerError::AlreadyLeased { device_id, .. }) => {
                info!(execution_id = %execution.id, owner = %device_id, "execution leased elsewhere");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.store
            .mark_execution_running(execution.id)
            .await
            .map_err(store_err)?;

        let outcome = self.run_operation(&execution, kind, &params).await;
        let (status, error_message) = match outcome {
            Ok((status, message)) => (status, message),
            Err(err) => (ExecutionStatus::Failed, Some(err.to_string())),
        };

        let applied = self
            .store
            .set_execution_status(execution.id, status, error_message)
            .await
            .map_err(store_err)?;
        guard.release().await;

        if applied {
            // Duplicate terminal reports were discarded above; only the one
            // applied transition drives chain decisions.
            self.post_terminal(&execution, kind, status).await?;
        }
        Ok(())
    }

    async fn run_operation(
        self: &Arc<Self>,
        execution: &ExecutionProcess,
        kind: CommandKind,
        params: &CommandParams,
    ) -> RunnerResult<(ExecutionStatus, Option<String>)> {
        let workspace = self
            .store
            .get_workspace(execution.workspace_id)
            .await
            .map_err(store_err)?;
        let session = self
            .store
            .get_session(execution.session_id)
            .await
            .map_err(store_err)?;
        let repos = self
            .store
            .list_workspace_repos(workspace.id, true)
            .await
            .map_err(store_err)?;
        if repos.is_empty() {
            return Err(RunnerError::fatal("workspace has no enabled repos"));
        }

        let mut materialised = Vec::with_capacity(repos.len());
        for repo in &repos {
            let path = self.worktrees.ensure_worktree(&workspace, repo).await?;
            let entry = (repo.clone(), path);
            // Each repo's before commit is captured as soon as its worktree
            // exists; a later repo failing to materialise must not lose it.
            snapshot::record_before(&self.store, execution.id, std::slice::from_ref(&entry))
                .await?;
            materialised.push(entry);
        }

        let cwd = active_repo_path(&workspace, &materialised);
        let scripts = RepoScripts::load(&cwd)
            .map_err(|e| RunnerError::fatal(format!("repo run config: {e}")))?;

        if kind == CommandKind::RunCodingAgent {
            self.setup_phase(&workspace, &session, &scripts, &materialised, &cwd)
                .await?;
        }

        let plan = plan_operation(kind, params, &scripts, &self.config)?;
        let env = runtime_env(&workspace, &session);
        let exit = self.run_supervised(execution.id, plan, &env, &cwd).await?;

        // An execution only completes once nothing is pending on it.
        let denial = if exit.cancelled {
            None
        } else {
            self.approvals.resolve_all_for_execution(execution.id).await?
        };

        snapshot::record_after(&self.store, execution.id, &materialised).await?;

        let (status, message) = if exit.cancelled {
            (ExecutionStatus::Killed, None)
        } else if let Some(denied) = denial {
            (
                ExecutionStatus::Failed,
                Some(format!(
                    "approval '{}' was {}",
                    denied.kind,
                    match denied.status {
                        overseer_common::types::ApprovalStatus::Expired => "not answered in time",
                        _ => "rejected",
                    }
                )),
            )
        } else if exit.exit_code == Some(0) {
            (ExecutionStatus::Completed, None)
        } else {
            (
                ExecutionStatus::Failed,
                Some(match exit.exit_code {
                    Some(code) => format!("process exited with code {code}"),
                    None => "process terminated by signal".to_string(),
                }),
            )
        };
        Ok((status, message))
    }

    /// Supervise one process: journal, log forwarding, cancel subscription.
    async fn run_supervised(
        &self,
        execution_id: Uuid,
        plan: OperationPlan,
        env: &[(String, String)],
        cwd: &std::path::Path,
    ) -> RunnerResult<ExitOutcome> {
        let journal = Arc::new(ExecutionJournal::open(
            self.worktrees.managed_root(),
            execution_id,
            self.config.process.log_ring_bytes,
        )?);

        let mut handle = self
            .supervisor
            .run(execution_id, plan, env, cwd, journal)
            .await?;

        if let Some(mut logs) = handle.take_logs() {
            let store = self.store.clone();
            tokio::spawn(async move {
                while let Some(record) = logs.recv().await {
                    if let Err(err) = store.append_log(record).await {
                        warn!(execution_id = %execution_id, "log forward failed: {err}");
                    }
                }
            });
        }

        // Cancellation arrives as a store mutation; watch for it.
        let trigger = handle.cancel_trigger();
        let mut events = self.store.subscribe();
        let current = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(store_err)?;
        if current.cancel_requested {
            trigger.fire();
        }
        let watcher = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::ExecutionUpdated(exec))
                        if exec.id == execution_id && exec.cancel_requested =>
                    {
                        trigger.fire();
                        break;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let outcome = handle.wait().await;
        watcher.abort();
        outcome
    }

    /// Run configured setup scripts as their own executions. When every
    /// script is marked parallel they start independently and the coding
    /// action proceeds alongside them; otherwise they chain sequentially
    /// into it and a failure aborts the chain.
    async fn setup_phase(
        self: &Arc<Self>,
        workspace: &Workspace,
        session: &Session,
        scripts: &RepoScripts,
        materialised: &[(WorkspaceRepo, PathBuf)],
        cwd: &std::path::Path,
    ) -> RunnerResult<()> {
        if scripts.setup.is_empty() {
            return Ok(());
        }
        let stamp = self
            .worktrees
            .managed_root()
            .join(workspace.id.to_string())
            .join(SETUP_STAMP);
        if stamp.exists() {
            return Ok(());
        }

        let env = runtime_env(workspace, session);
        if scripts.setup_is_parallel() {
            for script in &scripts.setup {
                let execution = self
                    .store
                    .start_execution(workspace.id, session.id, RunReason::Setup, None)
                    .await
                    .map_err(store_err)?;
                let plan = OperationPlan {
                    kind: CommandKind::RunSetupScript,
                    program: "bash".into(),
                    args: vec!["-c".into(), script.run.clone()],
                    stdin: crate::supervisor::StdinPolicy::Closed,
                };
                let this = self.clone();
                let env = env.clone();
                let cwd = cwd.to_path_buf();
                let repos = materialised.to_vec();
                let name = script.name.clone();
                tokio::spawn(async move {
                    if let Err(err) = this
                        .run_plain_action(execution, plan, &env, &cwd, &repos)
                        .await
                    {
                        warn!(script = %name, "parallel setup script failed: {err}");
                    }
                });
            }
            write_stamp(&stamp)?;
            return Ok(());
        }

        for script in &scripts.setup {
            let execution = self
                .store
                .start_execution(workspace.id, session.id, RunReason::Setup, None)
                .await
                .map_err(store_err)?;
            let plan = OperationPlan {
                kind: CommandKind::RunSetupScript,
                program: "bash".into(),
                args: vec!["-c".into(), script.run.clone()],
                stdin: crate::supervisor::StdinPolicy::Closed,
            };
            let status = self
                .run_plain_action(execution, plan, &env, cwd, materialised)
                .await?;
            if status != ExecutionStatus::Completed {
                return Err(RunnerError::fatal(format!(
                    "setup script '{}' did not complete",
                    script.name
                )));
            }
        }
        write_stamp(&stamp)?;
        Ok(())
    }

    /// Minimal action path for setup/cleanup/archive scripts: lease,
    /// before snapshot, run, after snapshot, single terminal transition.
    /// No queue, no chaining.
    async fn run_plain_action(
        &self,
        execution: ExecutionProcess,
        plan: OperationPlan,
        env: &[(String, String)],
        cwd: &std::path::Path,
        repos: &[(WorkspaceRepo, PathBuf)],
    ) -> RunnerResult<ExecutionStatus> {
        let guard = match self.leases.acquire(execution.id).await {
            Ok(guard) => guard,
            Err(RunnerError::AlreadyLeased { .. }) => return Ok(execution.status),
            Err(err) => return Err(err),
        };

        let result = match snapshot::record_before(&self.store, execution.id, repos).await {
            Ok(()) => self.run_supervised(execution.id, plan, env, cwd).await,
            Err(err) => Err(err),
        };
        let (status, message) = match result {
            Ok(exit) if exit.cancelled => (ExecutionStatus::Killed, None),
            Ok(exit) if exit.exit_code == Some(0) => (ExecutionStatus::Completed, None),
            Ok(exit) => (
                ExecutionStatus::Failed,
                Some(match exit.exit_code {
                    Some(code) => format!("process exited with code {code}"),
                    None => "process terminated by signal".to_string(),
                }),
            ),
            Err(err) => (ExecutionStatus::Failed, Some(err.to_string())),
        };

        if let Err(err) = snapshot::record_after(&self.store, execution.id, repos).await {
            warn!(execution_id = %execution.id, "after snapshot failed: {err}");
        }

        self.store
            .set_execution_status(execution.id, status, message)
            .await
            .map_err(store_err)?;
        guard.release().await;
        Ok(status)
    }

    /// Chain decisions after the one applied terminal transition.
    async fn post_terminal(
        self: &Arc<Self>,
        execution: &ExecutionProcess,
        kind: CommandKind,
        status: ExecutionStatus,
    ) -> RunnerResult<()> {
        if kind != CommandKind::RunCodingAgent {
            return Ok(());
        }

        let mut follow_up_started = false;
        match status {
            ExecutionStatus::Completed => {
                let fresh = self
                    .store
                    .get_execution(execution.id)
                    .await
                    .map_err(store_err)?;
                if !fresh.queued_follow_up_consumed {
                    if let Some(message) = self
                        .store
                        .consume_queued_message(execution.session_id)
                        .await
                        .map_err(store_err)?
                    {
                        self.store
                            .mark_follow_up_consumed(execution.id)
                            .await
                            .map_err(store_err)?;
                        info!(
                            session_id = %execution.session_id,
                            "starting follow-up coding agent execution"
                        );
                        let next = self
                            .store
                            .start_execution(
                                execution.workspace_id,
                                execution.session_id,
                                RunReason::CodingAgent,
                                message.executor.clone(),
                            )
                            .await
                            .map_err(store_err)?;
                        let params = CommandParams::CodingAgent(CodingAgentParams {
                            prompt: message.message,
                            executor: message.executor,
                        });
                        self.spawn_action(next, CommandKind::RunCodingAgent, params);
                        follow_up_started = true;
                    }
                }
            }
            ExecutionStatus::Failed | ExecutionStatus::Killed | ExecutionStatus::Dropped => {
                // A follow-up queued against work that did not finish is
                // stale intent; discard rather than consume.
                if let Some(discarded) = self
                    .store
                    .discard_queued_message(execution.session_id)
                    .await
                    .map_err(store_err)?
                {
                    info!(
                        session_id = %execution.session_id,
                        message_id = %discarded.id,
                        "discarded queued follow-up"
                    );
                }
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {}
        }

        // Cleanup runs after the chain's last coding action terminates.
        if !follow_up_started {
            self.maybe_chain_cleanup(execution).await?;
        }
        Ok(())
    }

    async fn maybe_chain_cleanup(self: &Arc<Self>, execution: &ExecutionProcess) -> RunnerResult<()> {
        let workspace = self
            .store
            .get_workspace(execution.workspace_id)
            .await
            .map_err(store_err)?;
        let session = self
            .store
            .get_session(execution.session_id)
            .await
            .map_err(store_err)?;
        let repos = self
            .store
            .list_workspace_repos(workspace.id, true)
            .await
            .map_err(store_err)?;
        if repos.is_empty() {
            return Ok(());
        }
        let mut materialised = Vec::with_capacity(repos.len());
        for repo in &repos {
            let path = self.worktrees.ensure_worktree(&workspace, repo).await?;
            materialised.push((repo.clone(), path));
        }
        let cwd = active_repo_path(&workspace, &materialised);
        let scripts = RepoScripts::load(&cwd)
            .map_err(|e| RunnerError::fatal(format!("repo run config: {e}")))?;
        let Some(cleanup) = scripts.cleanup.clone() else {
            return Ok(());
        };

        let cleanup_exec = self
            .store
            .start_execution(workspace.id, session.id, RunReason::Cleanup, None)
            .await
            .map_err(store_err)?;
        let plan = OperationPlan {
            kind: CommandKind::RunCleanupScript,
            program: "bash".into(),
            args: vec!["-c".into(), cleanup],
            stdin: crate::supervisor::StdinPolicy::Closed,
        };
        let env = runtime_env(&workspace, &session);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this
                .run_plain_action(cleanup_exec, plan, &env, &cwd, &materialised)
                .await
            {
                warn!("cleanup action failed: {err}");
            }
        });
        Ok(())
    }

    /// Watch for workspace archival and deletion and apply the filesystem
    /// policy. Deletion always removes the workspace directory; archival
    /// does so only when the operator opted in (`archive.remove_worktrees`)
    /// and stays reversible: an unarchived workspace re-materialises any
    /// missing worktree on its next `ensure_worktree`.
    pub fn spawn_workspace_watcher(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut events = this.store.subscribe();
            loop {
                match events.recv().await {
                    Ok(StoreEvent::WorkspaceDeleted(id)) => {
                        if let Err(err) = this.worktrees.remove_workspace(id).await {
                            warn!(workspace_id = %id, "workspace removal failed: {err}");
                        }
                    }
                    Ok(StoreEvent::WorkspaceUpdated(ws))
                        if ws.archived && this.config.archive.remove_worktrees =>
                    {
                        info!(workspace_id = %ws.id, "archival removes worktrees by policy");
                        match this.store.list_workspace_repos(ws.id, false).await {
                            Ok(repos) => {
                                for repo in repos {
                                    if let Err(err) = this.worktrees.remove_worktree(&ws, &repo).await
                                    {
                                        warn!(
                                            repo = %repo.repo_name,
                                            "worktree removal failed: {err}"
                                        );
                                    }
                                }
                                if let Err(err) = this.worktrees.remove_workspace(ws.id).await {
                                    warn!(workspace_id = %ws.id, "workspace removal failed: {err}");
                                }
                            }
                            Err(err) => warn!("repo listing failed during archive: {err}"),
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Reset the session to the state before execution `target`: each
    /// enabled repo is hard-reset to the target's `before_head_commit`
    /// (falling back to the prior execution's `after_head_commit`), the
    /// superseded executions are marked `dropped`, and the reset itself is
    /// recorded as a `system` execution.
    pub async fn reset_session(
        &self,
        session_id: Uuid,
        target_execution_id: Uuid,
        force: bool,
    ) -> RunnerResult<ExecutionProcess> {
        let target = self
            .store
            .get_execution(target_execution_id)
            .await
            .map_err(store_err)?;
        if target.session_id != session_id {
            return Err(RunnerError::fatal(format!(
                "execution {target_execution_id} does not belong to session {session_id}"
            )));
        }
        let session = self.store.get_session(session_id).await.map_err(store_err)?;
        let workspace = self
            .store
            .get_workspace(session.workspace_id)
            .await
            .map_err(store_err)?;
        let repos = self
            .store
            .list_workspace_repos(workspace.id, true)
            .await
            .map_err(store_err)?;

        let target_states = self
            .store
            .get_repo_states(target.id)
            .await
            .map_err(store_err)?;
        let executions = self
            .store
            .list_executions(session_id)
            .await
            .map_err(store_err)?;
        let prior = executions
            .iter()
            .rev()
            .find(|e| e.started_at < target.started_at);
        let prior_states = match prior {
            Some(prior) => self.store.get_repo_states(prior.id).await.map_err(store_err)?,
            None => Vec::new(),
        };

        // Plan every repo first; abort before any mutation on a dirty tree.
        let mut planned: Vec<(WorkspaceRepo, PathBuf, String)> = Vec::new();
        for repo in &repos {
            let head = target_states
                .iter()
                .find(|s| s.workspace_repo_id == repo.id)
                .and_then(|s| s.before_head_commit.clone())
                .or_else(|| {
                    prior_states
                        .iter()
                        .find(|s| s.workspace_repo_id == repo.id)
                        .and_then(|s| s.after_head_commit.clone())
                })
                .ok_or_else(|| {
                    RunnerError::fatal(format!(
                        "no recorded snapshot to reset repo '{}' to",
                        repo.repo_name
                    ))
                })?;

            let path = self.worktrees.ensure_worktree(&workspace, repo).await?;
            let clean = {
                let check = path.clone();
                tokio::task::spawn_blocking(move || git::is_clean(&check))
                    .await
                    .map_err(|e| RunnerError::fatal(format!("reset task panicked: {e}")))??
            };
            if !clean && !force {
                return Err(RunnerError::DirtyWorktree {
                    repo: repo.repo_name.clone(),
                });
            }
            planned.push((repo.clone(), path, head));
        }

        for (repo, path, head) in &planned {
            info!(repo = %repo.repo_name, head = %head, "resetting worktree");
            let path = path.clone();
            let head = head.clone();
            tokio::task::spawn_blocking(move || git::reset_hard(&path, &head))
                .await
                .map_err(|e| RunnerError::fatal(format!("reset task panicked: {e}")))??;
        }

        let dropped = self
            .store
            .drop_executions_since(session_id, target.started_at)
            .await
            .map_err(store_err)?;
        info!(count = dropped.len(), "reset dropped superseded executions");

        // The reset is itself history: record it as a system execution.
        let reset_exec = self
            .store
            .start_execution(workspace.id, session_id, RunReason::System, None)
            .await
            .map_err(store_err)?;
        self.store
            .set_execution_status(reset_exec.id, ExecutionStatus::Completed, None)
            .await
            .map_err(store_err)?;
        self.store
            .get_execution(reset_exec.id)
            .await
            .map_err(store_err)
    }
}

fn active_repo_path(workspace: &Workspace, materialised: &[(WorkspaceRepo, PathBuf)]) -> PathBuf {
    workspace
        .active_workspace_repo_id
        .and_then(|id| materialised.iter().find(|(repo, _)| repo.id == id))
        .unwrap_or(&materialised[0])
        .1
        .clone()
}

fn runtime_env(workspace: &Workspace, session: &Session) -> Vec<(String, String)> {
    vec![
        ("VK_WORKSPACE_ID".to_string(), workspace.id.to_string()),
        ("VK_WORKSPACE_BRANCH".to_string(), workspace.branch.clone()),
        ("VK_SESSION_ID".to_string(), session.id.to_string()),
    ]
}

fn write_stamp(stamp: &std::path::Path) -> RunnerResult<()> {
    if let Some(parent) = stamp.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RunnerError::io(format!("create {}", parent.display()), e))?;
    }
    std::fs::write(stamp, b"")
        .map_err(|e| RunnerError::io(format!("write {}", stamp.display()), e))
}
