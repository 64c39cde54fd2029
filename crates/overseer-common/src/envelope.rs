//! The dispatch envelope between control plane and runner.
//!
//! Intents are device-bound: the control plane signs the canonical form of
//! every envelope with the HMAC key enrolled for the target device, and the
//! runner verifies before anything else. Replay resistance comes from the
//! per-intent nonce and the TTL window.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::RunnerError;
use crate::types::RunReason;

type HmacSha256 = Hmac<Sha256>;

/// Closed set of operations the runner will execute. There is no raw shell
/// passthrough: scripts referenced here are resolved from repo configuration
/// on the runner side and substituted into fixed command templates.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    RunSetupScript,
    RunCleanupScript,
    RunArchiveScript,
    RunDevServer,
    RunCodingAgent,
    GitCommit,
    GitPush,
    OpenPr,
    AttachPr,
    TerminalSession,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::RunSetupScript => "run_setup_script",
            CommandKind::RunCleanupScript => "run_cleanup_script",
            CommandKind::RunArchiveScript => "run_archive_script",
            CommandKind::RunDevServer => "run_dev_server",
            CommandKind::RunCodingAgent => "run_coding_agent",
            CommandKind::GitCommit => "git_commit",
            CommandKind::GitPush => "git_push",
            CommandKind::OpenPr => "open_pr",
            CommandKind::AttachPr => "attach_pr",
            CommandKind::TerminalSession => "terminal_session",
        }
    }
}

/// Per-kind parameter payloads. Deserializing an intent's raw `params`
/// through [`CommandParams::validate`] is the schema check: unknown fields
/// and wrong shapes are rejected before the operation is planned.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScriptParams {
    /// Named script from the repo run configuration.
    pub script: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CodingAgentParams {
    pub prompt: String,
    #[serde(default)]
    pub executor: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GitCommitParams {
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GitPushParams {
    #[serde(default)]
    pub remote: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OpenPrParams {
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AttachPrParams {
    pub pr_number: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandParams {
    Script(ScriptParams),
    CodingAgent(CodingAgentParams),
    GitCommit(GitCommitParams),
    GitPush(GitPushParams),
    OpenPr(OpenPrParams),
    AttachPr(AttachPrParams),
    TerminalSession,
}

impl CommandParams {
    /// Validate a raw parameter object against the schema for `kind`.
    pub fn validate(kind: CommandKind, params: &Value) -> Result<Self, RunnerError> {
        let invalid = |err: serde_json::Error| RunnerError::InvalidParams {
            kind: kind.as_str(),
            reason: err.to_string(),
        };
        match kind {
            CommandKind::RunSetupScript
            | CommandKind::RunCleanupScript
            | CommandKind::RunArchiveScript
            | CommandKind::RunDevServer => Ok(CommandParams::Script(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            CommandKind::RunCodingAgent => Ok(CommandParams::CodingAgent(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            CommandKind::GitCommit => Ok(CommandParams::GitCommit(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            CommandKind::GitPush => Ok(CommandParams::GitPush(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            CommandKind::OpenPr => Ok(CommandParams::OpenPr(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            CommandKind::AttachPr => Ok(CommandParams::AttachPr(
                serde_json::from_value(params.clone()).map_err(invalid)?,
            )),
            CommandKind::TerminalSession => {
                if params.is_null() || params == &Value::Object(Default::default()) {
                    Ok(CommandParams::TerminalSession)
                } else {
                    Err(RunnerError::InvalidParams {
                        kind: kind.as_str(),
                        reason: "terminal_session takes no parameters".into(),
                    })
                }
            }
        }
    }
}

/// Execution intent envelope, control plane → runner.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionIntent {
    pub intent_id: Uuid,
    pub nonce: String,
    pub target_device_id: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub workspace_id: Uuid,
    pub session_id: Uuid,
    pub execution_id: Uuid,
    pub run_reason: RunReason,
    pub command_kind: CommandKind,
    pub params: Value,
    pub principal: String,
    /// Base64 HMAC-SHA256 over [`ExecutionIntent::canonical_string`].
    pub hmac: String,
}

impl ExecutionIntent {
    /// Canonical byte string the signature covers. Params are included via
    /// their compact JSON form so any mutation invalidates the signature.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.intent_id,
            self.nonce,
            self.target_device_id,
            self.issued_at.timestamp_millis(),
            self.ttl_ms,
            self.workspace_id,
            self.session_id,
            self.execution_id,
            serde_json::to_string(&self.run_reason).unwrap_or_default(),
            self.command_kind.as_str(),
            serde_json::to_string(&self.params).unwrap_or_default(),
        )
    }

    pub fn sign(&mut self, key: &[u8]) -> Result<(), RunnerError> {
        self.hmac = compute_hmac(key, &self.canonical_string())?;
        Ok(())
    }

    pub fn verify(&self, key: &[u8]) -> Result<(), RunnerError> {
        let expected = compute_hmac(key, &self.canonical_string())?;
        if constant_time_eq(expected.as_bytes(), self.hmac.as_bytes()) {
            Ok(())
        } else {
            Err(RunnerError::BadSignature {
                intent_id: self.intent_id,
            })
        }
    }

    /// Whether the TTL window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let deadline = self.issued_at + chrono::Duration::milliseconds(self.ttl_ms as i64);
        now > deadline
    }
}

fn compute_hmac(key: &[u8], canonical: &str) -> Result<String, RunnerError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| RunnerError::Fatal {
        context: "HMAC key of invalid length".into(),
    })?;
    mac.update(canonical.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogPayload {
    Bytes { bytes: String },
    JsonPatch { json_patch: Value },
}

impl LogPayload {
    pub fn len(&self) -> usize {
        match self {
            LogPayload::Bytes { bytes } => bytes.len(),
            LogPayload::JsonPatch { json_patch } => json_patch.to_string().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One log record, runner → control plane. `seq` is strictly increasing
/// within an execution; a gap is a protocol error on the consumer side.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub execution_id: Uuid,
    pub seq: u64,
    pub stream: LogStream,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: LogPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent() -> ExecutionIntent {
        ExecutionIntent {
            intent_id: Uuid::new_v4(),
            nonce: "n-1".into(),
            target_device_id: "dev-1".into(),
            issued_at: Utc::now(),
            ttl_ms: 30_000,
            workspace_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            run_reason: RunReason::CodingAgent,
            command_kind: CommandKind::RunCodingAgent,
            params: json!({"prompt": "do the thing"}),
            principal: "user-1".into(),
            hmac: String::new(),
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let mut i = intent();
        i.sign(b"device-key").unwrap();
        i.verify(b"device-key").unwrap();
        assert!(i.verify(b"other-key").is_err());
    }

    #[test]
    fn tampered_params_invalidate_signature() {
        let mut i = intent();
        i.sign(b"device-key").unwrap();
        i.params = json!({"prompt": "do a different thing"});
        assert!(i.verify(b"device-key").is_err());
    }

    #[test]
    fn ttl_expiry_uses_issued_at() {
        let mut i = intent();
        i.issued_at = Utc::now() - chrono::Duration::seconds(60);
        i.ttl_ms = 1_000;
        assert!(i.is_expired(Utc::now()));
        i.ttl_ms = 120_000;
        assert!(!i.is_expired(Utc::now()));
    }

    #[test]
    fn params_validate_per_kind() {
        let ok = CommandParams::validate(
            CommandKind::RunCodingAgent,
            &json!({"prompt": "x", "executor": "claude"}),
        );
        assert!(matches!(ok, Ok(CommandParams::CodingAgent(_))));

        let missing = CommandParams::validate(CommandKind::GitCommit, &json!({}));
        assert!(missing.is_err());

        let extra = CommandParams::validate(
            CommandKind::RunSetupScript,
            &json!({"script": "setup", "shell": "rm -rf /"}),
        );
        assert!(extra.is_err(), "unknown fields must be rejected");
    }

    #[test]
    fn log_record_serde_shape() {
        let rec = LogRecord {
            execution_id: Uuid::new_v4(),
            seq: 3,
            stream: LogStream::Stderr,
            ts: Utc::now(),
            payload: LogPayload::Bytes {
                bytes: "warning: foo\n".into(),
            },
        };
        let v: Value = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["stream"], "stderr");
        assert_eq!(v["kind"], "bytes");
        let back: LogRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }
}
