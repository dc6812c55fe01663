// ABOUTME: Core AgentBackend trait that every backend adapter implements.
// ABOUTME: Defines session lifecycle, prompt streaming, cancellation and permission hooks.

use crate::error::{AgentError, Result};
use crate::handle::MessageReceiver;
use crate::permission::{PermissionHandler, PermissionResponse};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Options for `new_session`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Working directory; falls back to the backend's configured directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Model for this session; falls back to the backend's current model
    #[serde(default)]
    pub model: Option<String>,
    /// MCP server descriptors passed through verbatim
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

/// Core trait that all agent backends implement.
///
/// Backends are `Send + Sync` and are shared as `Arc<dyn AgentBackend>`.
/// Each instance owns exactly one transport; dropping the backend tears
/// the transport down.
pub trait AgentBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Start the transport and complete the handshake. Calling it again on a
    /// live backend is a no-op.
    fn initialize<'a>(&'a self) -> BoxFuture<'a, Result<()>>;

    /// Create a new session, returns the adapter-local session ID
    fn new_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<String>>;

    /// Send a prompt and receive its stream of unified messages.
    ///
    /// The stream ends after `TurnComplete` or `Error`. Only one prompt may be
    /// in flight per session; a second call fails with `PromptInFlight`.
    fn prompt<'a>(
        &'a self,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageReceiver>>;

    /// Cancel the in-flight prompt of a session, without waiting for the
    /// backend to acknowledge
    fn cancel_prompt<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Answer a pending permission prompt. Unknown or already-answered ids
    /// are ignored; returns whether a prompt was settled.
    fn respond_to_permission(
        &self,
        session_id: &str,
        request_id: &str,
        response: PermissionResponse,
    ) -> bool;

    /// Install the handler that receives permission prompts
    fn on_permission_request(&self, handler: PermissionHandler);

    /// Settle everything outstanding and close the transport. Best-effort:
    /// teardown errors are logged, never returned.
    fn disconnect<'a>(&'a self) -> BoxFuture<'a, ()>;

    /// Model used for new prompts, if known
    fn model(&self) -> Option<String> {
        None
    }

    /// Switch model. Backends that bake the model into the process launch
    /// relaunch it, which invalidates every existing session.
    fn set_model<'a>(&'a self, _model: &'a str) -> BoxFuture<'a, Result<()>> {
        let backend = self.name().to_string();
        Box::pin(async move {
            Err(AgentError::Unsupported {
                backend,
                operation: "set_model",
            })
        })
    }
}

/// Shared, type-erased backend
pub type SharedBackend = Arc<dyn AgentBackend>;
