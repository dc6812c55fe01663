// ABOUTME: Mock backend for testing - returns pre-configured unified messages.
// ABOUTME: Allows deterministic tests of consumers without spawning agent processes or servers.
//!
//! # Example
//!
//! ```no_run
//! use switchboard_agent::backends::mock::MockBackend;
//! use switchboard_agent::{AgentBackend, SessionConfig, UnifiedMessage};
//!
//! # async fn example() {
//! let mock = MockBackend::new()
//!     .on_prompt("hello").respond_text("Hi there!")
//!     .on_prompt("delete").ask_permission("rm", serde_json::json!({"path": "/tmp/x"}));
//!
//! let session_id = mock.new_session(SessionConfig::default()).await.unwrap();
//! let messages = mock.prompt(&session_id, "hello").await.unwrap().collect().await;
//! assert_eq!(messages[0], UnifiedMessage::text("Hi there!"));
//! # }
//! ```

use crate::error::Result;
use crate::handle::MessageReceiver;
use crate::message::{StopReason, ToolStatus, UnifiedMessage};
use crate::permission::{
    PermissionCorrelator, PermissionHandler, PermissionOption, PermissionRequest,
    PermissionResponse,
};
use crate::registry::BackendFactory;
use crate::session::SessionTable;
use crate::traits::{AgentBackend, SessionConfig, SharedBackend};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

enum Step {
    Emit(UnifiedMessage),
    /// Run a tool only if the permission handler approves it
    Permission { tool: String, input: Value },
}

struct Expectation {
    pattern: String,
    steps: Vec<Step>,
}

struct Shared {
    sessions: Mutex<SessionTable>,
    permissions: PermissionCorrelator,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, session_id: &str, message: UnifiedMessage) {
        self.sessions()
            .with_prompt(session_id, |prompt| prompt.push(message));
    }
}

/// Mock backend for testing
pub struct MockBackend {
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    shared: Arc<Shared>,
    model: Mutex<Option<String>>,
}

impl MockBackend {
    /// Create a new mock backend with no expectations
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(VecDeque::new())),
            shared: Arc::new(Shared {
                sessions: Mutex::new(SessionTable::new()),
                permissions: PermissionCorrelator::new(),
            }),
            model: Mutex::new(None),
        }
    }

    /// Set up an expectation for a prompt containing the given pattern
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            backend: self,
            pattern: pattern.to_string(),
        }
    }

    /// Factory function for the registry
    pub fn factory() -> BackendFactory {
        Box::new(|_config| {
            let backend: SharedBackend = Arc::new(MockBackend::new());
            Ok(backend)
        })
    }

    fn push_expectation(self, pattern: String, steps: Vec<Step>) -> Self {
        self.expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation { pattern, steps });
        self
    }

    /// Match with FIFO preference: the front first, then the first match anywhere
    fn take_expectation(&self, text: &str) -> Option<Vec<Step>> {
        let mut exp = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        if exp.front().is_some_and(|front| text.contains(&front.pattern)) {
            return exp.pop_front().map(|e| e.steps);
        }
        exp.iter()
            .position(|e| text.contains(&e.pattern))
            .and_then(|i| exp.remove(i))
            .map(|e| e.steps)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_steps(shared: Arc<Shared>, session_id: String, turn_id: u64, steps: Vec<Step>) {
    for (index, step) in steps.into_iter().enumerate() {
        match step {
            Step::Emit(message) if message.is_terminal() => {
                shared.sessions().settle(&session_id, Some(turn_id), message);
                return;
            }
            Step::Emit(message) => shared.push(&session_id, message),
            Step::Permission { tool, input } => {
                let call_id = format!("mock-call-{turn_id}-{index}");
                shared.push(
                    &session_id,
                    UnifiedMessage::ToolCall {
                        id: call_id.clone(),
                        name: tool.clone(),
                        input: input.clone(),
                        status: ToolStatus::Pending,
                    },
                );

                let decision = shared.permissions.open(PermissionRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: session_id.clone(),
                    tool_call_id: Some(call_id.clone()),
                    title: tool.clone(),
                    kind: Some("execute".to_string()),
                    raw_input: input.clone(),
                    options: vec![
                        PermissionOption {
                            id: "allow".into(),
                            name: "Allow".into(),
                            kind: "allow_once".into(),
                        },
                        PermissionOption {
                            id: "reject".into(),
                            name: "Reject".into(),
                            kind: "reject_once".into(),
                        },
                    ],
                    schema: None,
                });
                let response = decision
                    .await
                    .unwrap_or_else(|_| PermissionResponse::cancelled());

                let (status, output) = if response.decision.is_approval() {
                    (ToolStatus::Completed, json!("ok"))
                } else {
                    (ToolStatus::Failed, json!(format!("{} by user", response.decision)))
                };
                shared.push(
                    &session_id,
                    UnifiedMessage::ToolCall {
                        id: call_id.clone(),
                        name: tool,
                        input,
                        status,
                    },
                );
                shared.push(
                    &session_id,
                    UnifiedMessage::ToolResult {
                        id: call_id,
                        output,
                        status,
                    },
                );
            }
        }
    }
    shared.sessions().settle(
        &session_id,
        Some(turn_id),
        UnifiedMessage::turn_complete(StopReason::EndTurn),
    );
}

impl AgentBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn initialize<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn new_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let model = config.model.or_else(|| self.model());
            let mut sessions = self.shared.sessions();
            let remote_id = format!("mock-session-{}", sessions.len() + 1);
            Ok(sessions.insert(remote_id, model))
        })
    }

    fn prompt<'a>(
        &'a self,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageReceiver>> {
        Box::pin(async move {
            let start = self.shared.sessions().begin_prompt(session_id)?;
            let steps = self.take_expectation(text).unwrap_or_else(|| {
                vec![Step::Emit(UnifiedMessage::text(format!(
                    "Mock: no expectation for '{}'",
                    text
                )))]
            });

            let shared = Arc::clone(&self.shared);
            let session_id = session_id.to_string();
            let turn_id = start.turn_id;
            let cancel = start.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = run_steps(shared, session_id, turn_id, steps) => {}
                    _ = cancel.cancelled() => {}
                }
            });
            Ok(start.receiver)
        })
    }

    fn cancel_prompt<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.shared.sessions().remote_id(session_id)?;
            self.shared.permissions.cancel_session(session_id);
            self.shared.sessions().settle(
                session_id,
                None,
                UnifiedMessage::turn_complete(StopReason::Cancelled),
            );
            Ok(())
        })
    }

    fn respond_to_permission(
        &self,
        session_id: &str,
        request_id: &str,
        response: PermissionResponse,
    ) -> bool {
        self.shared.permissions.respond(session_id, request_id, response)
    }

    fn on_permission_request(&self, handler: PermissionHandler) {
        self.shared.permissions.set_handler(handler);
    }

    fn disconnect<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.shared.sessions().dispose_all();
            self.shared.permissions.cancel_all();
        })
    }

    fn model(&self) -> Option<String> {
        self.model.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            *self.model.lock().unwrap_or_else(|e| e.into_inner()) = Some(model.to_string());
            Ok(())
        })
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    backend: MockBackend,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a list of messages; `TurnComplete(end_turn)` is appended
    /// unless the list already ends the turn
    pub fn respond_with(self, messages: Vec<UnifiedMessage>) -> MockBackend {
        let steps = messages.into_iter().map(Step::Emit).collect();
        self.backend.push_expectation(self.pattern, steps)
    }

    /// Respond with a single text chunk
    pub fn respond_text(self, text: &str) -> MockBackend {
        self.respond_with(vec![UnifiedMessage::text(text)])
    }

    /// Fail the turn
    pub fn respond_error(self, message: &str) -> MockBackend {
        self.respond_with(vec![UnifiedMessage::error(message)])
    }

    /// Ask the permission handler before "running" a tool
    pub fn ask_permission(self, tool: &str, input: Value) -> MockBackend {
        let steps = vec![Step::Permission {
            tool: tool.to_string(),
            input,
        }];
        self.backend.push_expectation(self.pattern, steps)
    }
}
