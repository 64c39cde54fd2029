//! Dispatch client: the runner's inbound edge.
//!
//! Intents are pulled over the store's mailbox, then validated in a fixed
//! order: signature, device binding, revocation, TTL, replay nonce,
//! principal authorization, parameter schema. Every rejection is
//! negative-acknowledged with a classified reason and an audit entry;
//! none of them is ever retried. Acknowledgements are idempotent.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use overseer_common::envelope::{CommandParams, ExecutionIntent};
use overseer_common::error::{RunnerError, RunnerResult};
use overseer_store::{ControlPlaneStore, IntentAck};

/// Bounded set of recently seen nonces.
pub struct NonceLru {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl NonceLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a nonce; returns `false` when it was already present.
    pub fn insert(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_string());
        self.order.push_back(nonce.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.seen.contains(nonce)
    }
}

pub struct DispatchClient {
    store: Arc<dyn ControlPlaneStore>,
    device_id: String,
    device_key: Vec<u8>,
    nonces: Mutex<NonceLru>,
    /// Intents successfully acquired; re-delivery of these is a no-op.
    accepted: Mutex<HashSet<Uuid>>,
}

impl DispatchClient {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        device_id: String,
        device_key_base64: &str,
        nonce_capacity: usize,
    ) -> RunnerResult<Self> {
        let device_key = general_purpose::STANDARD
            .decode(device_key_base64.trim())
            .map_err(|e| RunnerError::fatal(format!("device key is not valid base64: {e}")))?;
        Ok(Self {
            store,
            device_id,
            device_key,
            nonces: Mutex::new(NonceLru::new(nonce_capacity)),
            accepted: Mutex::new(HashSet::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Pull pending intents and validate each. Returns the accepted ones;
    /// rejected intents have been nacked and audited already. A re-delivered
    /// intent that was already acquired is acknowledged again and skipped.
    pub async fn poll_once(&self) -> RunnerResult<Vec<ExecutionIntent>> {
        let intents = self
            .store
            .pull_intents(&self.device_id)
            .await
            .map_err(|e| RunnerError::transient(format!("pull intents: {e}")))?;

        let mut accepted = Vec::new();
        for intent in intents {
            match self.admit(&intent).await {
                Ok(Admission::Fresh) => {
                    self.ack(&intent, IntentAck::Accepted).await;
                    accepted.push(intent);
                }
                Ok(Admission::Duplicate) => {
                    // Idempotent re-delivery: ack again, no side effects.
                    self.ack(&intent, IntentAck::Accepted).await;
                }
                Err(err) => {
                    warn!(
                        intent_id = %intent.intent_id,
                        reason = err.reason_code(),
                        "intent rejected: {err}"
                    );
                    self.audit_rejection(&intent, &err).await;
                    self.ack(
                        &intent,
                        IntentAck::Rejected {
                            reason: err.reason_code().to_string(),
                        },
                    )
                    .await;
                }
            }
        }
        Ok(accepted)
    }

    async fn admit(&self, intent: &ExecutionIntent) -> RunnerResult<Admission> {
        // Device binding comes before everything else: an envelope for a
        // different device must not even be signature-checked against our
        // key.
        if intent.target_device_id != self.device_id {
            return Err(RunnerError::DeviceMismatch {
                target: intent.target_device_id.clone(),
                local: self.device_id.clone(),
            });
        }

        let device = self
            .store
            .get_device(&self.device_id)
            .await
            .map_err(|e| RunnerError::transient(format!("device lookup: {e}")))?
            .ok_or_else(|| RunnerError::DeviceRevoked {
                device_id: self.device_id.clone(),
            })?;
        if device.is_revoked() {
            return Err(RunnerError::DeviceRevoked {
                device_id: self.device_id.clone(),
            });
        }

        intent.verify(&self.device_key)?;

        if intent.is_expired(Utc::now()) {
            return Err(RunnerError::TtlExpired {
                intent_id: intent.intent_id,
            });
        }

        {
            let mut nonces = self.nonces.lock().await;
            if nonces.contains(&intent.nonce) {
                if self.accepted.lock().await.contains(&intent.intent_id) {
                    return Ok(Admission::Duplicate);
                }
                return Err(RunnerError::ReplayedNonce {
                    nonce: intent.nonce.clone(),
                });
            }
            nonces.insert(&intent.nonce);
        }

        let authorized = self
            .store
            .is_authorized(&intent.principal, intent.workspace_id)
            .await
            .map_err(|e| RunnerError::transient(format!("authorization lookup: {e}")))?;
        if !authorized {
            return Err(RunnerError::NotAuthorized {
                principal: intent.principal.clone(),
                workspace_id: intent.workspace_id,
            });
        }

        // Schema check: the raw params must match the per-kind shape.
        CommandParams::validate(intent.command_kind, &intent.params)?;

        self.accepted.lock().await.insert(intent.intent_id);
        info!(
            intent_id = %intent.intent_id,
            execution_id = %intent.execution_id,
            command = intent.command_kind.as_str(),
            "intent accepted"
        );
        Ok(Admission::Fresh)
    }

    async fn ack(&self, intent: &ExecutionIntent, ack: IntentAck) {
        if let Err(err) = self
            .store
            .ack_intent(intent.intent_id, &intent.nonce, ack)
            .await
        {
            warn!(intent_id = %intent.intent_id, "intent ack failed: {err}");
        }
    }

    /// Rejections leave an audit record on the execution's log feed.
    async fn audit_rejection(&self, intent: &ExecutionIntent, err: &RunnerError) {
        let record = overseer_common::envelope::LogRecord {
            execution_id: intent.execution_id,
            seq: 0,
            stream: overseer_common::envelope::LogStream::System,
            ts: Utc::now(),
            payload: overseer_common::envelope::LogPayload::JsonPatch {
                json_patch: serde_json::json!({
                    "event": "dispatch_rejected",
                    "intent_id": intent.intent_id,
                    "reason": err.reason_code(),
                    "detail": err.to_string(),
                }),
            },
        };
        if let Err(err) = self.store.append_log(record).await {
            warn!(intent_id = %intent.intent_id, "audit append failed: {err}");
        }
    }
}

enum Admission {
    Fresh,
    Duplicate,
}
