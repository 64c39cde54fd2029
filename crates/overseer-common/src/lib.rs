//! Shared vocabulary for the Overseer workspace runner.
//!
//! Everything the control plane and the runner daemon agree on lives here:
//! the persisted document model, the signed execution-intent envelope, the
//! session status projection, the slash command surface, and the error
//! taxonomy with its retry classification.

pub mod command;
pub mod envelope;
pub mod error;
pub mod status;
pub mod types;

pub use envelope::{CommandKind, CommandParams, ExecutionIntent, LogPayload, LogRecord, LogStream};
pub use error::{ErrorClass, RetryBudget, RunnerError};
pub use status::session_status_for;
pub use types::{
    Approval, ApprovalStatus, DeviceEnrollment, ExecutionProcess, ExecutionRepoState,
    ExecutionStatus, QueuedMessage, QueuedMessageState, RepoSpec, RunReason, RunnerLease, Session,
    SessionStatus, Workspace, WorkspaceRepo,
};
