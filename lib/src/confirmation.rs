//! Tool confirmation broker
//!
//! Tracks confirmation requests that wait for a client decision. Every pending
//! entry is owned by an explicit session, and removing the entry from the map
//! is the only way to settle it, so each request resolves exactly once:
//! through a client answer, the timeout, or the connection closing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{ConfirmationConfig, UnattendedPolicy};
use crate::error::{AgentError, Result};
use crate::protocol::ServerFrame;
use crate::session::SessionId;

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_NO_TRANSPORT: &str = "no transport";
pub const REASON_CONNECTION_CLOSED: &str = "connection closed";

/// Outcome of a confirmation round-trip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    pub fn approved() -> Self {
        Self {
            confirmed: true,
            reason: None,
        }
    }

    pub fn denied(reason: Option<String>) -> Self {
        Self {
            confirmed: false,
            reason,
        }
    }

    pub fn timeout() -> Self {
        Self::denied(Some(REASON_TIMEOUT.to_string()))
    }

    fn unattended(policy: UnattendedPolicy) -> Self {
        Self {
            confirmed: policy.approves(),
            reason: Some(REASON_NO_TRANSPORT.to_string()),
        }
    }
}

/// A confirmation request ready to be carried to the client
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub confirmation_id: String,
    pub session_id: SessionId,
    pub tool_name: String,
    pub args: Value,
    pub message: String,
}

impl ConfirmationRequest {
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::ToolConfirmationRequest {
            confirmation_id: self.confirmation_id.clone(),
            tool_name: self.tool_name.clone(),
            args: self.args.clone(),
            message: self.message.clone(),
        }
    }
}

struct PendingConfirmation {
    session_id: SessionId,
    tool_name: String,
    created_at: Instant,
    settle_tx: oneshot::Sender<Decision>,
}

/// Drops the pending entry when the requesting task goes away unsettled
struct AbandonOnDrop<'a> {
    broker: &'a ConfirmationBroker,
    confirmation_id: &'a str,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.broker.lock().remove(self.confirmation_id).is_some() {
            tracing::debug!(confirmation_id = %self.confirmation_id, "Abandoned pending confirmation");
        }
    }
}

/// Correlates confirmation requests with client responses
pub struct ConfirmationBroker {
    pending: Mutex<HashMap<String, PendingConfirmation>>,
    timeout: Duration,
    unattended: UnattendedPolicy,
}

impl ConfirmationBroker {
    pub fn new(timeout: Duration, unattended: UnattendedPolicy) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            unattended,
        }
    }

    pub fn from_config(config: &ConfirmationConfig) -> Self {
        Self::new(config.timeout(), config.unattended)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn unattended_policy(&self) -> UnattendedPolicy {
        self.unattended
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingConfirmation>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask the client to confirm a tool call and wait for the decision
    ///
    /// `deliver` is called synchronously with the request and returns whether a
    /// transport accepted it. When it does not, the unattended policy decides.
    /// Otherwise the call resolves on [`settle`](Self::settle),
    /// [`cancel_session`](Self::cancel_session) or the timeout, whichever
    /// happens first.
    pub async fn request<F>(
        &self,
        session_id: &str,
        tool_name: &str,
        args: Value,
        message: String,
        deliver: F,
    ) -> Decision
    where
        F: FnOnce(ConfirmationRequest) -> bool,
    {
        let confirmation_id = Uuid::new_v4().to_string();
        let (settle_tx, mut settle_rx) = oneshot::channel();

        self.lock().insert(
            confirmation_id.clone(),
            PendingConfirmation {
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                created_at: Instant::now(),
                settle_tx,
            },
        );

        let _abandon = AbandonOnDrop {
            broker: self,
            confirmation_id: &confirmation_id,
        };

        let request = ConfirmationRequest {
            confirmation_id: confirmation_id.clone(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
            message,
        };

        if !deliver(request) {
            self.lock().remove(&confirmation_id);
            tracing::info!(
                session_id,
                tool_name,
                policy = ?self.unattended,
                "No transport for confirmation, applying unattended policy"
            );
            return Decision::unattended(self.unattended);
        }

        tracing::debug!(session_id, %confirmation_id, tool_name, "Awaiting tool confirmation");

        match tokio::time::timeout(self.timeout, &mut settle_rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => Decision::denied(Some(REASON_CONNECTION_CLOSED.to_string())),
            Err(_) => {
                if self.lock().remove(&confirmation_id).is_some() {
                    tracing::warn!(session_id, %confirmation_id, tool_name, "Tool confirmation timed out");
                    Decision::timeout()
                } else {
                    // Settled between the deadline and the removal attempt
                    settle_rx
                        .await
                        .unwrap_or_else(|_| Decision::denied(Some(REASON_CONNECTION_CLOSED.to_string())))
                }
            }
        }
    }

    /// Resolve a pending confirmation with the client's decision
    ///
    /// Unknown or already settled ids, and ids owned by another session, are
    /// reported as [`AgentError::ConfirmationNotFound`].
    pub fn settle(&self, confirmation_id: &str, session_id: &str, decision: Decision) -> Result<()> {
        let pending = {
            let mut pending = self.lock();
            match pending.get(confirmation_id) {
                Some(entry) if entry.session_id == session_id => pending.remove(confirmation_id),
                Some(entry) => {
                    tracing::warn!(
                        %confirmation_id,
                        owner = %entry.session_id,
                        responder = session_id,
                        "Confirmation answered by a different session"
                    );
                    None
                }
                None => None,
            }
        };

        let Some(pending) = pending else {
            return Err(AgentError::ConfirmationNotFound(confirmation_id.to_string()));
        };

        tracing::debug!(
            session_id,
            %confirmation_id,
            tool_name = %pending.tool_name,
            confirmed = decision.confirmed,
            waited_ms = pending.created_at.elapsed().as_millis() as u64,
            "Tool confirmation settled"
        );

        if pending.settle_tx.send(decision).is_err() {
            tracing::debug!(%confirmation_id, "Confirmation requester went away before settlement");
        }
        Ok(())
    }

    /// Deny every pending confirmation of a session; returns how many were settled
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let cancelled: Vec<(String, PendingConfirmation)> = {
            let mut pending = self.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = cancelled.len();
        for (confirmation_id, entry) in cancelled {
            tracing::debug!(session_id, %confirmation_id, "Cancelling pending confirmation");
            let _ = entry
                .settle_tx
                .send(Decision::denied(Some(REASON_CONNECTION_CLOSED.to_string())));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, confirmation_id: &str) -> bool {
        self.lock().contains_key(confirmation_id)
    }
}

impl Default for ConfirmationBroker {
    fn default() -> Self {
        Self::from_config(&ConfirmationConfig::default())
    }
}
