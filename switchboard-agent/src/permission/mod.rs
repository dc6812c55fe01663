// ABOUTME: Permission prompt types and the per-adapter correlator of pending prompts.
// ABOUTME: Bridges an inbound "may I run this tool" prompt to an externally supplied decision, once.

pub mod elicitation;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub use elicitation::coerce_decision;

/// Abstract answer to a permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Approved,
    ApprovedForSession,
    Denied,
    Abort,
}

impl PermissionDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionDecision::Approved => "approved",
            PermissionDecision::ApprovedForSession => "approved_for_session",
            PermissionDecision::Denied => "denied",
            PermissionDecision::Abort => "abort",
        }
    }

    pub fn is_approval(self) -> bool {
        matches!(
            self,
            PermissionDecision::Approved | PermissionDecision::ApprovedForSession
        )
    }
}

impl fmt::Display for PermissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision plus an optional human-supplied reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub decision: PermissionDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionResponse {
    pub fn with_reason(decision: PermissionDecision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: Some(reason.into()),
        }
    }

    /// The outcome used when nobody can answer (no handler, teardown, cancel)
    pub fn cancelled() -> Self {
        PermissionDecision::Abort.into()
    }
}

impl From<PermissionDecision> for PermissionResponse {
    fn from(decision: PermissionDecision) -> Self {
        Self {
            decision,
            reason: None,
        }
    }
}

/// One choice offered by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionOption {
    pub id: String,
    pub name: String,
    /// Backend vocabulary, e.g. `allow_once`, `allow_always`, `reject_once`
    pub kind: String,
}

/// Normalized permission prompt handed to the registered handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Opaque id to pass back to `respond_to_permission`
    pub id: String,
    /// Adapter-local session id
    pub session_id: String,
    pub tool_call_id: Option<String>,
    pub title: String,
    pub kind: Option<String>,
    pub raw_input: Value,
    pub options: Vec<PermissionOption>,
    /// Declared shape the wire answer must satisfy, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// Callback invoked for every permission prompt
pub type PermissionHandler = Arc<dyn Fn(PermissionRequest) + Send + Sync>;

struct PendingPermission {
    session_id: String,
    tx: oneshot::Sender<PermissionResponse>,
}

/// Table of permission prompts awaiting a decision.
///
/// Owned by exactly one adapter. Each entry settles at most once; answering an
/// unknown or already-answered id is a logged no-op.
#[derive(Default)]
pub struct PermissionCorrelator {
    pending: Mutex<HashMap<String, PendingPermission>>,
    handler: Mutex<Option<PermissionHandler>>,
}

impl PermissionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the external handler
    pub fn set_handler(&self, handler: PermissionHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Store the prompt and hand it to the handler.
    ///
    /// Returns a receiver that resolves with the decision. Without a handler
    /// the prompt is not stored and the receiver resolves to a cancelled
    /// outcome immediately.
    pub fn open(&self, request: PermissionRequest) -> oneshot::Receiver<PermissionResponse> {
        let (tx, rx) = oneshot::channel();

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(handler) = handler else {
            tracing::info!(
                request_id = %request.id,
                session_id = %request.session_id,
                "No permission handler registered, cancelling prompt"
            );
            let _ = tx.send(PermissionResponse::cancelled());
            return rx;
        };

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                request.id.clone(),
                PendingPermission {
                    session_id: request.session_id.clone(),
                    tx,
                },
            );

        tracing::debug!(request_id = %request.id, title = %request.title, "Permission requested");
        handler(request);
        rx
    }

    /// Settle a pending prompt. Returns false (and does nothing) on a miss.
    pub fn respond(&self, session_id: &str, request_id: &str, response: PermissionResponse) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(request_id) {
                Some(entry) if entry.session_id == session_id => pending.remove(request_id),
                _ => None,
            }
        };

        match entry {
            Some(entry) => {
                tracing::debug!(%request_id, decision = %response.decision, "Permission answered");
                let _ = entry.tx.send(response);
                true
            }
            None => {
                tracing::debug!(%session_id, %request_id, "No pending permission for response");
                false
            }
        }
    }

    /// Drop a prompt that was answered through another path
    pub fn forget(&self, request_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id)
            .is_some()
    }

    /// Answer every pending prompt of one session with a cancelled outcome
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let drained: Vec<PendingPermission> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(PermissionResponse::cancelled());
        }
        count
    }

    /// Answer every pending prompt with a cancelled outcome
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingPermission> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(PermissionResponse::cancelled());
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, session: &str) -> PermissionRequest {
        PermissionRequest {
            id: id.to_string(),
            session_id: session.to_string(),
            tool_call_id: Some("call-1".to_string()),
            title: "Run ls".to_string(),
            kind: Some("execute".to_string()),
            raw_input: json!({"command": "ls"}),
            options: vec![],
            schema: None,
        }
    }

    #[tokio::test]
    async fn test_no_handler_cancels_immediately() {
        let correlator = PermissionCorrelator::new();
        let rx = correlator.open(request("p1", "s1"));
        assert_eq!(rx.await.unwrap(), PermissionResponse::cancelled());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_response_is_a_no_op() {
        let correlator = PermissionCorrelator::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        correlator.set_handler(Arc::new(move |req: PermissionRequest| {
            seen_clone.lock().unwrap().push(req.id);
        }));

        let rx = correlator.open(request("p1", "s1"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["p1".to_string()]);

        assert!(correlator.respond("s1", "p1", PermissionDecision::Approved.into()));
        assert!(!correlator.respond("s1", "p1", PermissionDecision::Denied.into()));

        assert_eq!(rx.await.unwrap().decision, PermissionDecision::Approved);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_mismatched_ids_are_ignored() {
        let correlator = PermissionCorrelator::new();
        correlator.set_handler(Arc::new(|_| {}));
        let _rx = correlator.open(request("p1", "s1"));

        assert!(!correlator.respond("s1", "nope", PermissionDecision::Approved.into()));
        assert!(!correlator.respond("other-session", "p1", PermissionDecision::Approved.into()));
        assert!(correlator.is_pending("p1"));
    }

    #[tokio::test]
    async fn test_cancel_session_only_touches_that_session() {
        let correlator = PermissionCorrelator::new();
        correlator.set_handler(Arc::new(|_| {}));
        let a1 = correlator.open(request("a1", "a"));
        let a2 = correlator.open(request("a2", "a"));
        let _b1 = correlator.open(request("b1", "b"));

        assert_eq!(correlator.cancel_session("a"), 2);
        assert_eq!(a1.await.unwrap().decision, PermissionDecision::Abort);
        assert_eq!(a2.await.unwrap().decision, PermissionDecision::Abort);
        assert!(correlator.is_pending("b1"));

        assert_eq!(correlator.cancel_all(), 1);
        assert_eq!(correlator.pending_count(), 0);
    }
}
