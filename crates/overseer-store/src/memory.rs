//! In-memory driver for the control-plane store contract.
//!
//! One mutex over all document tables gives the single-writer transactional
//! model: every trait operation locks once, performs all of its writes, and
//! only then emits change events. Indexed queries are answered from the
//! same tables with the orderings the contract specifies.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

use overseer_common::envelope::{ExecutionIntent, LogRecord};
use overseer_common::status::project_session_status;
use overseer_common::types::{
    Approval, ApprovalStatus, DeviceEnrollment, ExecutionProcess, ExecutionRepoState,
    ExecutionStatus, QueuedMessage, QueuedMessageState, RunReason, RunnerLease, Session,
    SessionStatus, Workspace, WorkspaceRepo,
};

use crate::{
    ApprovalRequest, ControlPlaneStore, CreateWorkspace, IntentAck, RepoStatePatch, StoreError,
    StoreEvent, StoreResult, WorkspacePatch,
};

const EVENT_CAPACITY: usize = 256;

struct IntentEntry {
    intent: ExecutionIntent,
    ack: Option<IntentAck>,
}

#[derive(Default)]
struct Tables {
    workspaces: HashMap<Uuid, Workspace>,
    repos: HashMap<Uuid, WorkspaceRepo>,
    sessions: HashMap<Uuid, Session>,
    executions: HashMap<Uuid, ExecutionProcess>,
    repo_states: HashMap<(Uuid, Uuid), ExecutionRepoState>,
    /// Active `queued` row per session; terminal rows move to history.
    queue_active: HashMap<Uuid, QueuedMessage>,
    queue_history: Vec<QueuedMessage>,
    approvals: HashMap<Uuid, Approval>,
    devices: HashMap<String, DeviceEnrollment>,
    leases: HashMap<Uuid, RunnerLease>,
    intents: Vec<IntentEntry>,
    logs: HashMap<Uuid, Vec<LogRecord>>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            events,
        }
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine; the feed is best-effort per subscriber.
        let _ = self.events.send(event);
    }
}

impl Tables {
    fn latest_execution_status(&self, session_id: Uuid) -> Option<ExecutionStatus> {
        self.executions
            .values()
            .filter(|e| e.session_id == session_id)
            .max_by_key(|e| e.started_at)
            .map(|e| e.status)
    }

    fn has_pending_approval(&self, session_id: Uuid) -> bool {
        self.approvals
            .values()
            .any(|a| a.session_id == session_id && a.status == ApprovalStatus::Pending)
    }

    /// Recompute the derived session (and workspace) status from the latest
    /// execution plus the pending-approval override. Returns the documents
    /// that changed so events can be emitted after the write.
    fn project_session(&mut self, session_id: Uuid) -> (Option<Session>, Option<Workspace>) {
        let status = project_session_status(
            self.latest_execution_status(session_id),
            self.has_pending_approval(session_id),
        );

        let mut changed_session = None;
        let mut workspace_id = None;
        if let Some(session) = self.sessions.get_mut(&session_id) {
            workspace_id = Some(session.workspace_id);
            if session.status != status {
                session.status = status;
                changed_session = Some(session.clone());
            }
        }

        let mut changed_workspace = None;
        if let Some(ws_id) = workspace_id {
            if let Some(ws) = self.workspaces.get_mut(&ws_id) {
                if ws.status != status {
                    ws.status = status;
                    ws.updated_at = Utc::now();
                    changed_workspace = Some(ws.clone());
                }
            }
        }

        (changed_session, changed_workspace)
    }

    fn insert_execution(
        &mut self,
        workspace_id: Uuid,
        session_id: Uuid,
        run_reason: RunReason,
        executor: Option<String>,
        status: ExecutionStatus,
    ) -> StoreResult<ExecutionProcess> {
        if !self.workspaces.contains_key(&workspace_id) {
            return Err(StoreError::not_found("workspace", workspace_id));
        }
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        if session.workspace_id != workspace_id {
            return Err(StoreError::Conflict {
                context: format!("session {session_id} does not belong to {workspace_id}"),
            });
        }
        session.last_used_at = Utc::now();

        let execution = ExecutionProcess {
            id: Uuid::new_v4(),
            workspace_id,
            session_id,
            run_reason,
            status,
            executor,
            queued_follow_up_consumed: false,
            cancel_requested: false,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        self.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }
}

macro_rules! emit_projection {
    ($self:expr, $session:expr, $workspace:expr) => {
        if let Some(s) = $session {
            $self.emit(StoreEvent::SessionUpdated(s));
        }
        if let Some(w) = $workspace {
            $self.emit(StoreEvent::WorkspaceUpdated(w));
        }
    };
}

#[async_trait]
impl ControlPlaneStore for MemoryStore {
    async fn create_workspace(&self, req: CreateWorkspace) -> StoreResult<(Workspace, Session)> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let workspace_id = Uuid::new_v4();

        let mut repos: Vec<WorkspaceRepo> = req
            .repos
            .into_iter()
            .map(|spec| WorkspaceRepo {
                id: Uuid::new_v4(),
                workspace_id,
                repo_id: spec.repo_id,
                repo_name: spec.repo_name,
                target_branch: spec.target_branch,
                source_path: spec.source_path,
                enabled: spec.enabled,
                sort_order: spec.sort_order,
            })
            .collect();
        repos.sort_by_key(|r| r.sort_order);

        let session = Session {
            id: Uuid::new_v4(),
            workspace_id,
            title: req.initial_session_title,
            status: SessionStatus::Idle,
            last_used_at: now,
            created_at: now,
        };

        let workspace = Workspace {
            id: workspace_id,
            owner: req.owner,
            org: req.org,
            project: req.project,
            name: req.name,
            branch: req.branch,
            status: SessionStatus::Idle,
            archived: false,
            pinned: false,
            active_session_id: Some(session.id),
            active_workspace_repo_id: repos.first().map(|r| r.id),
            created_at: now,
            updated_at: now,
        };

        for repo in &repos {
            t.repos.insert(repo.id, repo.clone());
        }
        t.sessions.insert(session.id, session.clone());
        t.workspaces.insert(workspace_id, workspace.clone());
        drop(t);

        self.emit(StoreEvent::WorkspaceUpdated(workspace.clone()));
        self.emit(StoreEvent::SessionUpdated(session.clone()));
        Ok((workspace, session))
    }

    async fn update_workspace(&self, id: Uuid, patch: WorkspacePatch) -> StoreResult<Workspace> {
        let mut t = self.tables.lock().await;
        let ws = t
            .workspaces
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("workspace", id))?;
        if let Some(name) = patch.name {
            ws.name = name;
        }
        if let Some(archived) = patch.archived {
            ws.archived = archived;
        }
        if let Some(pinned) = patch.pinned {
            ws.pinned = pinned;
        }
        if let Some(status) = patch.status {
            ws.status = status;
        }
        if let Some(active_session) = patch.active_session_id {
            ws.active_session_id = active_session;
        }
        if let Some(active_repo) = patch.active_workspace_repo_id {
            ws.active_workspace_repo_id = active_repo;
        }
        ws.updated_at = Utc::now();
        let ws = ws.clone();
        drop(t);
        self.emit(StoreEvent::WorkspaceUpdated(ws.clone()));
        Ok(ws)
    }

    async fn get_workspace(&self, id: Uuid) -> StoreResult<Workspace> {
        let t = self.tables.lock().await;
        t.workspaces
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workspace", id))
    }

    async fn list_workspaces(
        &self,
        owner: &str,
        include_archived: bool,
    ) -> StoreResult<Vec<Workspace>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Workspace> = t
            .workspaces
            .values()
            .filter(|w| w.owner == owner && (include_archived || !w.archived))
            .cloned()
            .collect();
        out.sort_by_key(|w| std::cmp::Reverse(w.updated_at));
        Ok(out)
    }

    async fn delete_workspace(&self, id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if t.workspaces.remove(&id).is_none() {
            return Err(StoreError::not_found("workspace", id));
        }
        let session_ids: Vec<Uuid> = t
            .sessions
            .values()
            .filter(|s| s.workspace_id == id)
            .map(|s| s.id)
            .collect();
        let execution_ids: Vec<Uuid> = t
            .executions
            .values()
            .filter(|e| e.workspace_id == id)
            .map(|e| e.id)
            .collect();
        t.repos.retain(|_, r| r.workspace_id != id);
        t.sessions.retain(|_, s| s.workspace_id != id);
        t.executions.retain(|_, e| e.workspace_id != id);
        t.repo_states
            .retain(|(exec, _), _| !execution_ids.contains(exec));
        for sid in &session_ids {
            t.queue_active.remove(sid);
        }
        t.queue_history.retain(|m| !session_ids.contains(&m.session_id));
        t.approvals.retain(|_, a| a.workspace_id != id);
        for eid in &execution_ids {
            t.leases.remove(eid);
            t.logs.remove(eid);
        }
        drop(t);
        self.emit(StoreEvent::WorkspaceDeleted(id));
        Ok(())
    }

    async fn list_workspace_repos(
        &self,
        workspace_id: Uuid,
        enabled_only: bool,
    ) -> StoreResult<Vec<WorkspaceRepo>> {
        let t = self.tables.lock().await;
        let mut out: Vec<WorkspaceRepo> = t
            .repos
            .values()
            .filter(|r| r.workspace_id == workspace_id && (!enabled_only || r.enabled))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.sort_order);
        Ok(out)
    }

    async fn get_workspace_repo(&self, id: Uuid) -> StoreResult<WorkspaceRepo> {
        let t = self.tables.lock().await;
        t.repos
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workspace repo", id))
    }

    async fn create_session(
        &self,
        workspace_id: Uuid,
        title: Option<String>,
    ) -> StoreResult<Session> {
        let mut t = self.tables.lock().await;
        if !t.workspaces.contains_key(&workspace_id) {
            return Err(StoreError::not_found("workspace", workspace_id));
        }
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            workspace_id,
            title,
            status: SessionStatus::Idle,
            last_used_at: now,
            created_at: now,
        };
        t.sessions.insert(session.id, session.clone());
        drop(t);
        self.emit(StoreEvent::SessionUpdated(session.clone()));
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Session> {
        let t = self.tables.lock().await;
        t.sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    async fn list_sessions(&self, workspace_id: Uuid) -> StoreResult<Vec<Session>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Session> = t
            .sessions
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.last_used_at));
        Ok(out)
    }

    async fn start_execution(
        &self,
        workspace_id: Uuid,
        session_id: Uuid,
        run_reason: RunReason,
        executor: Option<String>,
    ) -> StoreResult<ExecutionProcess> {
        let mut t = self.tables.lock().await;
        let execution = t.insert_execution(
            workspace_id,
            session_id,
            run_reason,
            executor,
            ExecutionStatus::Running,
        )?;
        let (session, workspace) = t.project_session(session_id);
        drop(t);
        self.emit(StoreEvent::ExecutionUpdated(execution.clone()));
        emit_projection!(self, session, workspace);
        Ok(execution)
    }

    async fn create_pending_execution(
        &self,
        workspace_id: Uuid,
        session_id: Uuid,
        run_reason: RunReason,
        executor: Option<String>,
    ) -> StoreResult<ExecutionProcess> {
        let mut t = self.tables.lock().await;
        let execution = t.insert_execution(
            workspace_id,
            session_id,
            run_reason,
            executor,
            ExecutionStatus::Pending,
        )?;
        let (session, workspace) = t.project_session(session_id);
        drop(t);
        self.emit(StoreEvent::ExecutionUpdated(execution.clone()));
        emit_projection!(self, session, workspace);
        Ok(execution)
    }

    async fn mark_execution_running(&self, execution_id: Uuid) -> StoreResult<ExecutionProcess> {
        let mut t = self.tables.lock().await;
        let exec = t
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("execution", execution_id))?;
        if exec.status.is_terminal() {
            return Err(StoreError::Conflict {
                context: format!("execution {execution_id} is terminal"),
            });
        }
        exec.status = ExecutionStatus::Running;
        let execution = exec.clone();
        let session_id = execution.session_id;
        let (session, workspace) = t.project_session(session_id);
        drop(t);
        self.emit(StoreEvent::ExecutionUpdated(execution.clone()));
        emit_projection!(self, session, workspace);
        Ok(execution)
    }

    async fn set_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
    ) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let exec = t
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("execution", execution_id))?;

        if exec.status.is_terminal() {
            // Idempotent on the identical pair; any other transition out of
            // a terminal state is discarded.
            return Ok(exec.status == status);
        }

        exec.status = status;
        if error_message.is_some() {
            exec.error_message = error_message;
        }
        if status.is_terminal() {
            exec.completed_at = Some(Utc::now());
        }
        let execution = exec.clone();
        let session_id = execution.session_id;
        if status.is_terminal() {
            // Lease release is part of the terminal transition.
            t.leases.remove(&execution_id);
        }
        let (session, workspace) = t.project_session(session_id);
        drop(t);

        debug!(execution_id = %execution_id, status = status.as_str(), "execution status applied");
        self.emit(StoreEvent::ExecutionUpdated(execution));
        emit_projection!(self, session, workspace);
        Ok(true)
    }

    async fn mark_follow_up_consumed(&self, execution_id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let exec = t
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("execution", execution_id))?;
        exec.queued_follow_up_consumed = true;
        let execution = exec.clone();
        drop(t);
        self.emit(StoreEvent::ExecutionUpdated(execution));
        Ok(())
    }

    async fn request_cancel(&self, execution_id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let exec = t
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("execution", execution_id))?;
        if exec.cancel_requested || exec.status.is_terminal() {
            return Ok(());
        }
        exec.cancel_requested = true;
        let execution = exec.clone();
        drop(t);
        self.emit(StoreEvent::ExecutionUpdated(execution));
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<ExecutionProcess> {
        let t = self.tables.lock().await;
        t.executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("execution", id))
    }

    async fn list_executions(&self, session_id: Uuid) -> StoreResult<Vec<ExecutionProcess>> {
        let t = self.tables.lock().await;
        let mut out: Vec<ExecutionProcess> = t
            .executions
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.started_at);
        Ok(out)
    }

    async fn drop_executions_since(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let mut dropped = Vec::new();
        let mut updated = Vec::new();
        for exec in t.executions.values_mut() {
            if exec.session_id != session_id || exec.started_at < since {
                continue;
            }
            if exec.status == ExecutionStatus::Dropped {
                continue;
            }
            // The one sanctioned terminal overwrite: reset supersedes the
            // execution's history.
            exec.status = ExecutionStatus::Dropped;
            exec.completed_at.get_or_insert(now);
            dropped.push(exec.id);
            updated.push(exec.clone());
        }
        for id in &dropped {
            t.leases.remove(id);
        }
        let (session, workspace) = t.project_session(session_id);
        drop(t);
        for exec in updated {
            self.emit(StoreEvent::ExecutionUpdated(exec));
        }
        emit_projection!(self, session, workspace);
        Ok(dropped)
    }

    async fn executions_leased_by(&self, device_id: &str) -> StoreResult<Vec<ExecutionProcess>> {
        let t = self.tables.lock().await;
        let mut out: Vec<ExecutionProcess> = t
            .leases
            .values()
            .filter(|l| l.device_id == device_id)
            .filter_map(|l| t.executions.get(&l.execution_id))
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|e| e.started_at);
        Ok(out)
    }

    async fn upsert_execution_repo_state(
        &self,
        execution_id: Uuid,
        workspace_repo_id: Uuid,
        patch: RepoStatePatch,
    ) -> StoreResult<ExecutionRepoState> {
        let mut t = self.tables.lock().await;
        if !t.executions.contains_key(&execution_id) {
            return Err(StoreError::not_found("execution", execution_id));
        }
        let entry = t
            .repo_states
            .entry((execution_id, workspace_repo_id))
            .or_insert_with(|| ExecutionRepoState {
                execution_id,
                workspace_repo_id,
                before_head_commit: None,
                after_head_commit: None,
                repo_state: None,
            });
        if patch.before_head_commit.is_some() {
            entry.before_head_commit = patch.before_head_commit;
        }
        if patch.after_head_commit.is_some() {
            entry.after_head_commit = patch.after_head_commit;
        }
        if patch.repo_state.is_some() {
            entry.repo_state = patch.repo_state;
        }
        let state = entry.clone();
        drop(t);
        self.emit(StoreEvent::RepoStateUpdated(state.clone()));
        Ok(state)
    }

    async fn get_repo_states(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionRepoState>> {
        let t = self.tables.lock().await;
        Ok(t.repo_states
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn enqueue_follow_up(
        &self,
        session_id: Uuid,
        message: String,
        executor: Option<String>,
        variant: Option<String>,
        enqueueing_execution_id: Option<Uuid>,
    ) -> StoreResult<QueuedMessage> {
        let mut t = self.tables.lock().await;
        if !t.sessions.contains_key(&session_id) {
            return Err(StoreError::not_found("session", session_id));
        }
        let now = Utc::now();
        let row = t
            .queue_active
            .entry(session_id)
            .and_modify(|existing| {
                // Replacement rule: the newer follow-up supersedes in place.
                existing.message = message.clone();
                existing.executor = executor.clone();
                existing.variant = variant.clone();
                existing.enqueueing_execution_id = enqueueing_execution_id;
                existing.queued_at = now;
            })
            .or_insert_with(|| QueuedMessage {
                id: Uuid::new_v4(),
                session_id,
                message,
                executor,
                variant,
                enqueueing_execution_id,
                state: QueuedMessageState::Queued,
                queued_at: now,
            })
            .clone();
        drop(t);
        self.emit(StoreEvent::QueueUpdated(row.clone()));
        Ok(row)
    }

    async fn get_queue_status(&self, session_id: Uuid) -> StoreResult<Option<QueuedMessage>> {
        let t = self.tables.lock().await;
        Ok(t.queue_active.get(&session_id).cloned())
    }

    async fn consume_queued_message(&self, session_id: Uuid) -> StoreResult<Option<QueuedMessage>> {
        let mut t = self.tables.lock().await;
        let Some(mut row) = t.queue_active.remove(&session_id) else {
            return Ok(None);
        };
        row.state = QueuedMessageState::Consumed;
        t.queue_history.push(row.clone());
        drop(t);
        self.emit(StoreEvent::QueueUpdated(row.clone()));
        Ok(Some(row))
    }

    async fn discard_queued_message(&self, session_id: Uuid) -> StoreResult<Option<QueuedMessage>> {
        let mut t = self.tables.lock().await;
        let Some(mut row) = t.queue_active.remove(&session_id) else {
            return Ok(None);
        };
        row.state = QueuedMessageState::Discarded;
        t.queue_history.push(row.clone());
        drop(t);
        self.emit(StoreEvent::QueueUpdated(row.clone()));
        Ok(Some(row))
    }

    async fn request_approval(&self, req: ApprovalRequest) -> StoreResult<Approval> {
        let mut t = self.tables.lock().await;
        if !t.executions.contains_key(&req.execution_id) {
            return Err(StoreError::not_found("execution", req.execution_id));
        }
        let approval = Approval {
            id: Uuid::new_v4(),
            workspace_id: req.workspace_id,
            session_id: req.session_id,
            execution_id: req.execution_id,
            kind: req.kind,
            prompt: req.prompt,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            expires_at: req.expires_at,
            responded_at: None,
            responded_by: None,
        };
        t.approvals.insert(approval.id, approval.clone());
        let (session, workspace) = t.project_session(approval.session_id);
        drop(t);
        self.emit(StoreEvent::ApprovalUpdated(approval.clone()));
        emit_projection!(self, session, workspace);
        Ok(approval)
    }

    async fn respond_approval(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        responded_by: String,
    ) -> StoreResult<Approval> {
        if !matches!(status, ApprovalStatus::Approved | ApprovalStatus::Rejected) {
            return Err(StoreError::Conflict {
                context: "respond_approval only accepts approved or rejected".into(),
            });
        }
        let mut t = self.tables.lock().await;
        let approval = t
            .approvals
            .get_mut(&approval_id)
            .ok_or_else(|| StoreError::not_found("approval", approval_id))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(StoreError::NotPending { approval_id });
        }
        approval.status = status;
        approval.responded_at = Some(Utc::now());
        approval.responded_by = Some(responded_by);
        let approval = approval.clone();
        let (session, workspace) = t.project_session(approval.session_id);
        drop(t);
        self.emit(StoreEvent::ApprovalUpdated(approval.clone()));
        emit_projection!(self, session, workspace);
        Ok(approval)
    }

    async fn get_approval(&self, id: Uuid) -> StoreResult<Approval> {
        let t = self.tables.lock().await;
        t.approvals
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("approval", id))
    }

    async fn pending_approvals_for_execution(
        &self,
        execution_id: Uuid,
    ) -> StoreResult<Vec<Approval>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Approval> = t
            .approvals
            .values()
            .filter(|a| a.execution_id == execution_id && a.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.requested_at);
        Ok(out)
    }

    async fn expire_approvals(&self, now: DateTime<Utc>) -> StoreResult<Vec<Approval>> {
        let mut t = self.tables.lock().await;
        let mut expired = Vec::new();
        for approval in t.approvals.values_mut() {
            if approval.status != ApprovalStatus::Pending {
                continue;
            }
            let Some(expires_at) = approval.expires_at else {
                continue;
            };
            if expires_at < now {
                approval.status = ApprovalStatus::Expired;
                approval.responded_at = Some(now);
                expired.push(approval.clone());
            }
        }
        let sessions: Vec<Uuid> = expired.iter().map(|a| a.session_id).collect();
        let mut projections = Vec::new();
        for session_id in sessions {
            projections.push(t.project_session(session_id));
        }
        drop(t);
        for approval in &expired {
            self.emit(StoreEvent::ApprovalUpdated(approval.clone()));
        }
        for (session, workspace) in projections {
            emit_projection!(self, session, workspace);
        }
        Ok(expired)
    }

    async fn enroll_device(&self, enrollment: DeviceEnrollment) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        t.devices.insert(enrollment.device_id.clone(), enrollment);
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> StoreResult<Option<DeviceEnrollment>> {
        let t = self.tables.lock().await;
        Ok(t.devices.get(device_id).cloned())
    }

    async fn revoke_device(&self, device_id: &str) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let device = t
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::not_found("device", device_id))?;
        device.revoked_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn is_authorized(&self, principal: &str, workspace_id: Uuid) -> StoreResult<bool> {
        let t = self.tables.lock().await;
        let ws = t
            .workspaces
            .get(&workspace_id)
            .ok_or_else(|| StoreError::not_found("workspace", workspace_id))?;
        Ok(ws.owner == principal)
    }

    async fn acquire_lease(
        &self,
        execution_id: Uuid,
        device_id: &str,
        ttl: Duration,
    ) -> StoreResult<RunnerLease> {
        let mut t = self.tables.lock().await;
        if !t.executions.contains_key(&execution_id) {
            return Err(StoreError::not_found("execution", execution_id));
        }
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));

        if let Some(existing) = t.leases.get(&execution_id) {
            if existing.device_id != device_id && !existing.is_expired(now) {
                return Err(StoreError::AlreadyLeased {
                    execution_id,
                    device_id: existing.device_id.clone(),
                });
            }
        }

        let lease = RunnerLease {
            execution_id,
            device_id: device_id.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            expires_at: now + ttl,
        };
        t.leases.insert(execution_id, lease.clone());
        Ok(lease)
    }

    async fn heartbeat_lease(
        &self,
        execution_id: Uuid,
        device_id: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let lease = t
            .leases
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("lease", execution_id))?;
        if lease.device_id != device_id {
            return Err(StoreError::AlreadyLeased {
                execution_id,
                device_id: lease.device_id.clone(),
            });
        }
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        lease.heartbeat_at = now;
        lease.expires_at = now + ttl;
        Ok(())
    }

    async fn release_lease(&self, execution_id: Uuid, device_id: &str) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        match t.leases.get(&execution_id) {
            Some(lease) if lease.device_id == device_id => {
                t.leases.remove(&execution_id);
                Ok(())
            }
            // Releasing a lease we no longer hold is a no-op.
            _ => Ok(()),
        }
    }

    async fn get_lease(&self, execution_id: Uuid) -> StoreResult<Option<RunnerLease>> {
        let t = self.tables.lock().await;
        Ok(t.leases.get(&execution_id).cloned())
    }

    async fn sweep_orphans(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut t = self.tables.lock().await;
        let expired: Vec<Uuid> = t
            .leases
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.execution_id)
            .collect();

        let mut dropped = Vec::new();
        let mut updated = Vec::new();
        let mut sessions = Vec::new();
        let mut discard_queue_for = Vec::new();
        for execution_id in expired {
            t.leases.remove(&execution_id);
            let Some(exec) = t.executions.get_mut(&execution_id) else {
                continue;
            };
            if exec.status.is_terminal() {
                continue;
            }
            exec.status = ExecutionStatus::Dropped;
            exec.completed_at = Some(now);
            exec.error_message
                .get_or_insert_with(|| "runner lease expired".to_string());
            if exec.run_reason == RunReason::CodingAgent {
                discard_queue_for.push(exec.session_id);
            }
            dropped.push(execution_id);
            sessions.push(exec.session_id);
            updated.push(exec.clone());
        }
        // A dropped coding action never consumes its follow-up; the queued
        // message is discarded, not carried over.
        let mut discarded_rows = Vec::new();
        for session_id in discard_queue_for {
            if let Some(mut row) = t.queue_active.remove(&session_id) {
                row.state = QueuedMessageState::Discarded;
                t.queue_history.push(row.clone());
                discarded_rows.push(row);
            }
        }
        let mut projections = Vec::new();
        for session_id in sessions {
            projections.push(t.project_session(session_id));
        }
        drop(t);
        for exec in updated {
            self.emit(StoreEvent::ExecutionUpdated(exec));
        }
        for row in discarded_rows {
            self.emit(StoreEvent::QueueUpdated(row));
        }
        for (session, workspace) in projections {
            emit_projection!(self, session, workspace);
        }
        Ok(dropped)
    }

    async fn submit_intent(&self, intent: ExecutionIntent) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let device = intent.target_device_id.clone();
        t.intents.push(IntentEntry { intent, ack: None });
        drop(t);
        self.emit(StoreEvent::IntentSubmitted {
            target_device_id: device,
        });
        Ok(())
    }

    async fn pull_intents(&self, device_id: &str) -> StoreResult<Vec<ExecutionIntent>> {
        let t = self.tables.lock().await;
        Ok(t.intents
            .iter()
            .filter(|e| e.ack.is_none() && e.intent.target_device_id == device_id)
            .map(|e| e.intent.clone())
            .collect())
    }

    async fn ack_intent(&self, intent_id: Uuid, nonce: &str, ack: IntentAck) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let entry = t
            .intents
            .iter_mut()
            .find(|e| e.intent.intent_id == intent_id && e.intent.nonce == nonce)
            .ok_or_else(|| StoreError::not_found("intent", intent_id))?;
        if entry.ack.is_some() {
            // Re-acknowledgement of the same (intent, nonce) is a no-op.
            return Ok(());
        }
        entry.ack = Some(ack);
        Ok(())
    }

    async fn append_log(&self, record: LogRecord) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        t.logs.entry(record.execution_id).or_default().push(record);
        Ok(())
    }

    async fn get_logs(&self, execution_id: Uuid) -> StoreResult<Vec<LogRecord>> {
        let t = self.tables.lock().await;
        Ok(t.logs.get(&execution_id).cloned().unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
