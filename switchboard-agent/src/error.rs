// ABOUTME: Error taxonomy for backend adapters and transports.
// ABOUTME: Every adapter method returns these; teardown paths log and drop them.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = AgentError> = std::result::Result<T, E>;

/// Errors surfaced by transports and backend adapters
#[derive(Debug, Error)]
pub enum AgentError {
    /// Handshake failed, timed out, or every fallback candidate was exhausted
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// The backend refused to create a session
    #[error("session creation failed: {message}{}", hint_suffix(.hint))]
    SessionCreation {
        message: String,
        hint: Option<String>,
    },

    /// The transport closed while a request was outstanding
    #[error("transport closed")]
    TransportClosed,

    /// The backend answered a request with a JSON-RPC error
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The backend sent something we could not make sense of
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation did not settle in time
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// No session with this id is known to the adapter
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The session belonged to a backend process that is gone
    #[error("session {0} is no longer valid; create a new session")]
    SessionInvalid(String),

    /// A prompt is already streaming on this session
    #[error("a prompt is already in flight for session {0}")]
    PromptInFlight(String),

    /// The backend does not support the operation
    #[error("operation not supported by {backend}: {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },

    /// HTTP control call failed
    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be used to build a backend
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    /// Build a session-creation error, attaching a login hint when the
    /// message looks like an authentication failure.
    pub fn session_creation(message: impl Into<String>) -> Self {
        let message = message.into();
        let hint = looks_like_auth_failure(&message).then(|| {
            "the agent reports it is not authenticated; log in with the agent's own CLI or set its API key"
                .to_string()
        });
        AgentError::SessionCreation { message, hint }
    }

    /// Whether the error means the underlying process or stream went away
    pub fn is_disconnect(&self) -> bool {
        matches!(self, AgentError::TransportClosed | AgentError::Io(_))
    }
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_ref().map(|h| format!(" ({h})")).unwrap_or_default()
}

fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["auth", "login", "unauthorized", "api key", "api_key", "credential"]
        .iter()
        .any(|needle| lower.contains(needle))
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Protocol(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::Http(e.to_string())
    }
}
