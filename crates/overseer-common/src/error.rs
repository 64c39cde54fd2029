//! Error taxonomy shared across the runner and the store contract.
//!
//! Every error is either `Transient` (worth retrying with backoff) or
//! `Fatal` (escalate immediately). Protocol rejections (authorization,
//! device mismatch, replay, TTL) are never retried.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("path {path} escapes managed root {root}")]
    UnsafePath { path: PathBuf, root: PathBuf },

    #[error("worktree for repo '{repo}' has uncommitted changes")]
    DirtyWorktree { repo: String },

    #[error("branch '{branch}' conflicts with policy: {reason}")]
    BranchConflict { branch: String, reason: String },

    #[error("principal '{principal}' is not authorized for workspace {workspace_id}")]
    NotAuthorized {
        principal: String,
        workspace_id: Uuid,
    },

    #[error("intent targets device '{target}' but this runner is '{local}'")]
    DeviceMismatch { target: String, local: String },

    #[error("device '{device_id}' enrollment is revoked")]
    DeviceRevoked { device_id: String },

    #[error("nonce '{nonce}' was already seen")]
    ReplayedNonce { nonce: String },

    #[error("intent {intent_id} exceeded its TTL")]
    TtlExpired { intent_id: Uuid },

    #[error("intent {intent_id} carries an invalid signature")]
    BadSignature { intent_id: Uuid },

    #[error("invalid parameters for {kind}: {reason}")]
    InvalidParams {
        kind: &'static str,
        reason: String,
    },

    #[error("execution {execution_id} is already leased by device '{device_id}'")]
    AlreadyLeased {
        execution_id: Uuid,
        device_id: String,
    },

    #[error("lease on execution {execution_id} was lost")]
    LeaseLost { execution_id: Uuid },

    #[error("{context}")]
    Transient { context: String },

    #[error("{context}")]
    Fatal { context: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    pub fn transient(context: impl Into<String>) -> Self {
        RunnerError::Transient {
            context: context.into(),
        }
    }

    pub fn fatal(context: impl Into<String>) -> Self {
        RunnerError::Fatal {
            context: context.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        RunnerError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RunnerError::Transient { .. } | RunnerError::Io { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Protocol rejections carry an audit reason and are never retried.
    pub fn is_protocol_rejection(&self) -> bool {
        matches!(
            self,
            RunnerError::NotAuthorized { .. }
                | RunnerError::DeviceMismatch { .. }
                | RunnerError::DeviceRevoked { .. }
                | RunnerError::ReplayedNonce { .. }
                | RunnerError::TtlExpired { .. }
                | RunnerError::BadSignature { .. }
                | RunnerError::UnsafePath { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient && !self.is_protocol_rejection()
    }

    /// Short machine-readable reason used in nacks and audit entries.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RunnerError::UnsafePath { .. } => "unsafe_path",
            RunnerError::DirtyWorktree { .. } => "dirty_worktree",
            RunnerError::BranchConflict { .. } => "branch_conflict",
            RunnerError::NotAuthorized { .. } => "not_authorized",
            RunnerError::DeviceMismatch { .. } => "device_mismatch",
            RunnerError::DeviceRevoked { .. } => "device_revoked",
            RunnerError::ReplayedNonce { .. } => "replayed_nonce",
            RunnerError::TtlExpired { .. } => "ttl_expired",
            RunnerError::BadSignature { .. } => "bad_signature",
            RunnerError::InvalidParams { .. } => "invalid_params",
            RunnerError::AlreadyLeased { .. } => "already_leased",
            RunnerError::LeaseLost { .. } => "lease_lost",
            RunnerError::Transient { .. } | RunnerError::Io { .. } => "transient",
            RunnerError::Fatal { .. } => "fatal",
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Exponential backoff budget for transient failures. Once the attempt
/// budget is spent the caller escalates to `Fatal`.
#[derive(Clone, Copy, Debug)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryBudget {
    /// Delay before the given retry attempt (1-based). `None` when the
    /// budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        Some(exp.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_rejections_are_not_retryable() {
        let err = RunnerError::ReplayedNonce { nonce: "n".into() };
        assert!(!err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err = RunnerError::DeviceMismatch {
            target: "d2".into(),
            local: "d1".into(),
        };
        assert!(err.is_protocol_rejection());
        assert_eq!(err.reason_code(), "device_mismatch");
    }

    #[test]
    fn transient_errors_retry_until_budget_spent() {
        let err = RunnerError::transient("git index.lock contention");
        assert!(err.is_retryable());

        let budget = RetryBudget::default();
        assert!(budget.delay_for(0).is_some());
        assert!(budget.delay_for(3).is_some());
        assert!(budget.delay_for(4).is_none(), "budget of 4 attempts is spent");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let budget = RetryBudget {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let d0 = budget.delay_for(0).unwrap();
        let d1 = budget.delay_for(1).unwrap();
        let d9 = budget.delay_for(9).unwrap();
        assert!(d1 > d0);
        assert_eq!(d9, Duration::from_secs(1));
    }
}
