use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A branch-scoped grouping of one or more repositories.
///
/// Workspaces are created on explicit user action. Archiving hides a
/// workspace from default views but keeps every document and worktree
/// recoverable; deletion is hard and may only touch paths under the
/// managed root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub owner: String,
    pub org: Option<String>,
    pub project: Option<String>,
    pub name: String,
    /// Working branch checked out in every worktree of this workspace.
    pub branch: String,
    pub status: SessionStatus,
    pub archived: bool,
    pub pinned: bool,
    pub active_session_id: Option<Uuid>,
    pub active_workspace_repo_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One repository attached to a workspace.
///
/// Physical layout is `<managed_root>/<workspace_id>/<repo_name>`; the
/// worktree shares its object store with the clone at `source_path`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceRepo {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// External repository identity (host slug or registry id).
    pub repo_id: String,
    /// Directory name of the worktree under the workspace directory.
    pub repo_name: String,
    /// Branch the workspace branch is created from.
    pub target_branch: String,
    /// Local clone backing the worktree's git object store.
    pub source_path: PathBuf,
    pub enabled: bool,
    pub sort_order: i32,
}

/// Derived activity status shared by sessions and their workspace.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Idle,
    NeedsAttention,
    Error,
}

/// A conversation thread with a coding agent inside a workspace.
///
/// Sessions share the workspace filesystem but not history. Status is a
/// projection of the most recent execution (see [`crate::status`]).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    Setup,
    CodingAgent,
    Cleanup,
    Archive,
    DevServer,
    Review,
    System,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
    Dropped,
}

impl ExecutionStatus {
    /// Terminal statuses are sinks: an execution takes exactly one
    /// terminal transition and never reverts.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Killed
                | ExecutionStatus::Dropped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Killed => "killed",
            ExecutionStatus::Dropped => "dropped",
        }
    }
}

/// One run of a typed operation tied to a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionProcess {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub session_id: Uuid,
    pub run_reason: RunReason,
    pub status: ExecutionStatus,
    /// Named executor profile (which coding agent binary to run).
    pub executor: Option<String>,
    pub queued_follow_up_consumed: bool,
    /// Set by the control plane when the user asks for cancellation; the
    /// runner observes it through the change subscription.
    #[serde(default)]
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Per-(execution, repo) HEAD snapshot. `before_head_commit` is captured
/// before any mutation, `after_head_commit` after terminal exit; together
/// they make session reset deterministic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRepoState {
    pub execution_id: Uuid,
    pub workspace_repo_id: Uuid,
    pub before_head_commit: Option<String>,
    pub after_head_commit: Option<String>,
    pub repo_state: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueuedMessageState {
    Queued,
    Consumed,
    Discarded,
}

/// Single-slot follow-up queue entry. At most one `queued` row exists per
/// session; a newer follow-up overwrites the pending one in place.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub message: String,
    pub executor: Option<String>,
    pub variant: Option<String>,
    pub enqueueing_execution_id: Option<Uuid>,
    pub state: QueuedMessageState,
    pub queued_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    /// Expiry counts as a denial for chain decisions.
    pub fn is_denial(self) -> bool {
        matches!(
            self,
            ApprovalStatus::Rejected | ApprovalStatus::Expired | ApprovalStatus::Cancelled
        )
    }
}

/// A durable human-approval gate raised by a running execution.
///
/// While any approval for a session is `pending`, the session is held at
/// `needs_attention`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Approval {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub session_id: Uuid,
    pub execution_id: Uuid,
    pub kind: String,
    pub prompt: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub responded_by: Option<String>,
}

/// A runner device enrolled with the control plane. The key material is
/// the shared secret used to verify intent signatures for this device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeviceEnrollment {
    pub device_id: String,
    pub owning_principal: String,
    /// Base64-encoded HMAC key bound to this device.
    pub public_key: String,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl DeviceEnrollment {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Short-lived claim over one execution held by exactly one runner.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunnerLease {
    pub execution_id: Uuid,
    pub device_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RunnerLease {
    /// A lease whose heartbeat has aged past the TTL is reclaimable by the
    /// orphan sweep.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Parameters for one repo when creating a workspace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoSpec {
    pub repo_id: String,
    pub repo_name: String,
    pub target_branch: String,
    pub source_path: PathBuf,
    pub enabled: bool,
    pub sort_order: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_sinks() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Killed.is_terminal());
        assert!(ExecutionStatus::Dropped.is_terminal());
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let s = serde_json::to_string(&SessionStatus::NeedsAttention).unwrap();
        assert_eq!(s, "\"needs_attention\"");
        let r: RunReason = serde_json::from_str("\"coding_agent\"").unwrap();
        assert_eq!(r, RunReason::CodingAgent);
    }

    #[test]
    fn expiry_and_rejection_both_deny() {
        assert!(ApprovalStatus::Rejected.is_denial());
        assert!(ApprovalStatus::Expired.is_denial());
        assert!(!ApprovalStatus::Approved.is_denial());
        assert!(!ApprovalStatus::Pending.is_denial());
    }
}
