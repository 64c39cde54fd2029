//! Control-plane state store contract.
//!
//! The store owns every persisted document: workspaces, sessions,
//! executions, per-execution repo states, the single-slot follow-up queue,
//! approvals, device enrollments, runner leases, and the intent mailbox.
//! Each trait operation is atomic across all writes it performs; concurrent
//! mutations serialize per document. The runner never writes documents
//! directly and the store never touches the managed filesystem root.
//!
//! Any transactional document store with indexed queries and change
//! subscriptions can implement this trait; [`memory::MemoryStore`] is the
//! in-process driver used by the daemon's embedded mode and by tests.

pub mod memory;
pub mod sweep;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use overseer_common::envelope::{ExecutionIntent, LogRecord};
use overseer_common::types::{
    Approval, ApprovalStatus, DeviceEnrollment, ExecutionProcess, ExecutionRepoState, QueuedMessage,
    RepoSpec, RunReason, RunnerLease, Session, Workspace, WorkspaceRepo,
};

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("execution {execution_id} is already leased by device '{device_id}'")]
    AlreadyLeased {
        execution_id: Uuid,
        device_id: String,
    },

    #[error("approval {approval_id} is not pending")]
    NotPending { approval_id: Uuid },

    #[error("conflicting write: {context}")]
    Conflict { context: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Change-feed event emitted after each committed mutation.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    WorkspaceUpdated(Workspace),
    WorkspaceDeleted(uuid::Uuid),
    SessionUpdated(Session),
    ExecutionUpdated(ExecutionProcess),
    RepoStateUpdated(ExecutionRepoState),
    QueueUpdated(QueuedMessage),
    ApprovalUpdated(Approval),
    IntentSubmitted { target_device_id: String },
}

#[derive(Clone, Debug)]
pub struct CreateWorkspace {
    pub owner: String,
    pub org: Option<String>,
    pub project: Option<String>,
    pub name: String,
    pub branch: String,
    pub repos: Vec<RepoSpec>,
    pub initial_session_title: Option<String>,
}

/// Partial update for `update_workspace`; `None` fields are untouched.
/// A patched `status` is a hint only: the next projection recomputes it
/// from the latest execution.
#[derive(Clone, Debug, Default)]
pub struct WorkspacePatch {
    pub name: Option<String>,
    pub archived: Option<bool>,
    pub pinned: Option<bool>,
    pub status: Option<overseer_common::types::SessionStatus>,
    pub active_session_id: Option<Option<Uuid>>,
    pub active_workspace_repo_id: Option<Option<Uuid>>,
}

/// Partial update for repo state; prior non-null fields are kept.
#[derive(Clone, Debug, Default)]
pub struct RepoStatePatch {
    pub before_head_commit: Option<String>,
    pub after_head_commit: Option<String>,
    pub repo_state: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct ApprovalRequest {
    pub workspace_id: Uuid,
    pub session_id: Uuid,
    pub execution_id: Uuid,
    pub kind: String,
    pub prompt: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome attached to an intent acknowledgement. Re-delivery of the same
/// (intent, nonce) after a successful ack is a no-op.
#[derive(Clone, Debug, PartialEq)]
pub enum IntentAck {
    Accepted,
    Rejected { reason: String },
}

#[async_trait]
pub trait ControlPlaneStore: Send + Sync {
    // -- workspaces ---------------------------------------------------------

    /// Atomic create: workspace + its repos + one initial session, with the
    /// active-session and active-repo pointers assigned; or nothing.
    async fn create_workspace(&self, req: CreateWorkspace) -> StoreResult<(Workspace, Session)>;

    async fn update_workspace(&self, id: Uuid, patch: WorkspacePatch) -> StoreResult<Workspace>;

    async fn get_workspace(&self, id: Uuid) -> StoreResult<Workspace>;

    /// Ordered by `updated_at` descending; archived workspaces are hidden
    /// unless requested.
    async fn list_workspaces(
        &self,
        owner: &str,
        include_archived: bool,
    ) -> StoreResult<Vec<Workspace>>;

    /// Hard delete of the workspace and every owned document. Filesystem
    /// cleanup is the runner's job and is guarded separately.
    async fn delete_workspace(&self, id: Uuid) -> StoreResult<()>;

    /// Ordered by `sort_order`.
    async fn list_workspace_repos(
        &self,
        workspace_id: Uuid,
        enabled_only: bool,
    ) -> StoreResult<Vec<WorkspaceRepo>>;

    async fn get_workspace_repo(&self, id: Uuid) -> StoreResult<WorkspaceRepo>;

    // -- sessions -----------------------------------------------------------

    async fn create_session(
        &self,
        workspace_id: Uuid,
        title: Option<String>,
    ) -> StoreResult<Session>;

    async fn get_session(&self, id: Uuid) -> StoreResult<Session>;

    /// Ordered by `last_used_at` descending.
    async fn list_sessions(&self, workspace_id: Uuid) -> StoreResult<Vec<Session>>;

    // -- executions ---------------------------------------------------------

    /// Create an execution already `running` and project session and
    /// workspace status accordingly.
    async fn start_execution(
        &self,
        workspace_id: Uuid,
        session_id: Uuid,
        run_reason: RunReason,
        executor: Option<String>,
    ) -> StoreResult<ExecutionProcess>;

    /// Create an execution in `pending`, to be claimed by a runner.
    async fn create_pending_execution(
        &self,
        workspace_id: Uuid,
        session_id: Uuid,
        run_reason: RunReason,
        executor: Option<String>,
    ) -> StoreResult<ExecutionProcess>;

    /// The dispatch claim: `pending` → `running`. No-op if already running.
    async fn mark_execution_running(&self, execution_id: Uuid) -> StoreResult<ExecutionProcess>;

    /// Returns `true` when the status was applied. A terminal execution
    /// absorbs the identical status idempotently and rejects any other
    /// transition by returning `false`; callers discard duplicates. On a
    /// terminal status this sets `completed_at` and releases the lease.
    async fn set_execution_status(
        &self,
        execution_id: Uuid,
        status: overseer_common::types::ExecutionStatus,
        error_message: Option<String>,
    ) -> StoreResult<bool>;

    async fn mark_follow_up_consumed(&self, execution_id: Uuid) -> StoreResult<()>;

    /// User-initiated cancel; the runner observes it via subscription.
    /// Idempotent.
    async fn request_cancel(&self, execution_id: Uuid) -> StoreResult<()>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<ExecutionProcess>;

    /// Ordered by `started_at` ascending.
    async fn list_executions(&self, session_id: Uuid) -> StoreResult<Vec<ExecutionProcess>>;

    /// Session reset support: mark every execution in the session with
    /// `started_at >= since` as `dropped`. Returns the ids dropped.
    async fn drop_executions_since(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>>;

    /// Non-terminal executions whose current lease belongs to `device_id`.
    async fn executions_leased_by(&self, device_id: &str) -> StoreResult<Vec<ExecutionProcess>>;

    // -- repo states --------------------------------------------------------

    /// Upsert keyed by (execution, workspace repo); partial updates keep
    /// prior non-null fields.
    async fn upsert_execution_repo_state(
        &self,
        execution_id: Uuid,
        workspace_repo_id: Uuid,
        patch: RepoStatePatch,
    ) -> StoreResult<ExecutionRepoState>;

    async fn get_repo_states(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionRepoState>>;

    // -- follow-up queue ----------------------------------------------------

    /// Single-slot: overwrite the active queued row if one exists,
    /// refreshing `queued_at`; insert otherwise.
    async fn enqueue_follow_up(
        &self,
        session_id: Uuid,
        message: String,
        executor: Option<String>,
        variant: Option<String>,
        enqueueing_execution_id: Option<Uuid>,
    ) -> StoreResult<QueuedMessage>;

    async fn get_queue_status(&self, session_id: Uuid) -> StoreResult<Option<QueuedMessage>>;

    async fn consume_queued_message(&self, session_id: Uuid) -> StoreResult<Option<QueuedMessage>>;

    async fn discard_queued_message(&self, session_id: Uuid) -> StoreResult<Option<QueuedMessage>>;

    // -- approvals ----------------------------------------------------------

    /// Insert pending and hold session + workspace at `needs_attention`.
    async fn request_approval(&self, req: ApprovalRequest) -> StoreResult<Approval>;

    /// Only `approved`/`rejected` are accepted; rejects unless pending.
    async fn respond_approval(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        responded_by: String,
    ) -> StoreResult<Approval>;

    async fn get_approval(&self, id: Uuid) -> StoreResult<Approval>;

    /// Ordered by `requested_at`.
    async fn pending_approvals_for_execution(
        &self,
        execution_id: Uuid,
    ) -> StoreResult<Vec<Approval>>;

    /// Reaper: transition pending approvals past `expires_at` to `expired`.
    async fn expire_approvals(&self, now: DateTime<Utc>) -> StoreResult<Vec<Approval>>;

    // -- devices ------------------------------------------------------------

    async fn enroll_device(&self, enrollment: DeviceEnrollment) -> StoreResult<()>;

    async fn get_device(&self, device_id: &str) -> StoreResult<Option<DeviceEnrollment>>;

    async fn revoke_device(&self, device_id: &str) -> StoreResult<()>;

    async fn is_authorized(&self, principal: &str, workspace_id: Uuid) -> StoreResult<bool>;

    // -- leases -------------------------------------------------------------

    /// Atomic acquire. Fails with [`StoreError::AlreadyLeased`] when a fresh
    /// lease exists for another device; an expired lease is replaced.
    /// Re-acquiring an own fresh lease refreshes it.
    async fn acquire_lease(
        &self,
        execution_id: Uuid,
        device_id: &str,
        ttl: Duration,
    ) -> StoreResult<RunnerLease>;

    async fn heartbeat_lease(
        &self,
        execution_id: Uuid,
        device_id: &str,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn release_lease(&self, execution_id: Uuid, device_id: &str) -> StoreResult<()>;

    async fn get_lease(&self, execution_id: Uuid) -> StoreResult<Option<RunnerLease>>;

    /// Control-plane-side orphan sweep: executions with an expired lease and
    /// a non-terminal status become `dropped`. Returns the ids dropped.
    async fn sweep_orphans(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;

    // -- dispatch mailbox ---------------------------------------------------

    async fn submit_intent(&self, intent: ExecutionIntent) -> StoreResult<()>;

    /// Undelivered intents addressed to `device_id`, oldest first.
    async fn pull_intents(&self, device_id: &str) -> StoreResult<Vec<ExecutionIntent>>;

    /// Idempotent: acknowledging the same (intent, nonce) twice is a no-op
    /// and re-delivery after a successful ack produces no side effects.
    async fn ack_intent(&self, intent_id: Uuid, nonce: &str, ack: IntentAck) -> StoreResult<()>;

    // -- logs ---------------------------------------------------------------

    async fn append_log(&self, record: LogRecord) -> StoreResult<()>;

    async fn get_logs(&self, execution_id: Uuid) -> StoreResult<Vec<LogRecord>>;

    // -- subscriptions ------------------------------------------------------

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
