//! Session status as a pure projection of execution state.
//!
//! Expressing the mapping as one function (rather than ad-hoc patches
//! scattered through the store) keeps the monotonicity invariant checkable:
//! the session status is always `session_status_for` of the most recent
//! execution, overridden to `needs_attention` while approvals are pending.

use crate::types::{ExecutionStatus, SessionStatus};

/// Map an execution status to the session status it projects.
///
/// `pending`/`running` project `running`; `failed`/`killed` demand user
/// attention; `completed`/`dropped` return the session to `idle`. A
/// terminal execution therefore never projects `running`, which is what
/// makes the projection monotonic.
pub fn session_status_for(status: ExecutionStatus) -> SessionStatus {
    match status {
        ExecutionStatus::Pending | ExecutionStatus::Running => SessionStatus::Running,
        ExecutionStatus::Failed | ExecutionStatus::Killed => SessionStatus::NeedsAttention,
        ExecutionStatus::Completed | ExecutionStatus::Dropped => SessionStatus::Idle,
    }
}

/// Full projection: the latest execution plus the pending-approval override.
pub fn project_session_status(
    latest_execution: Option<ExecutionStatus>,
    has_pending_approval: bool,
) -> SessionStatus {
    if has_pending_approval {
        return SessionStatus::NeedsAttention;
    }
    latest_execution.map_or(SessionStatus::Idle, session_status_for)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_matches_contract() {
        assert_eq!(
            session_status_for(ExecutionStatus::Pending),
            SessionStatus::Running
        );
        assert_eq!(
            session_status_for(ExecutionStatus::Running),
            SessionStatus::Running
        );
        assert_eq!(
            session_status_for(ExecutionStatus::Failed),
            SessionStatus::NeedsAttention
        );
        assert_eq!(
            session_status_for(ExecutionStatus::Killed),
            SessionStatus::NeedsAttention
        );
        assert_eq!(
            session_status_for(ExecutionStatus::Completed),
            SessionStatus::Idle
        );
        assert_eq!(
            session_status_for(ExecutionStatus::Dropped),
            SessionStatus::Idle
        );
    }

    #[test]
    fn pending_approval_overrides_everything() {
        assert_eq!(
            project_session_status(Some(ExecutionStatus::Running), true),
            SessionStatus::NeedsAttention
        );
        assert_eq!(
            project_session_status(None, true),
            SessionStatus::NeedsAttention
        );
    }

    #[test]
    fn empty_session_is_idle() {
        assert_eq!(project_session_status(None, false), SessionStatus::Idle);
    }
}
