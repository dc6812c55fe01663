// ABOUTME: Protocol adapters that drive heterogeneous coding-agent backends through one contract.
// ABOUTME: Framed-stdio and HTTP+SSE transports, session lifecycle, permission correlation, normalization.

pub mod config;
pub mod error;
pub mod handle;
pub mod message;
pub mod normalize;
pub mod permission;
pub mod registry;
pub mod session;
pub mod timeout;
pub mod traits;
pub mod transport;

pub mod backends;

pub use error::{AgentError, Result};
pub use handle::MessageReceiver;
pub use message::{StopReason, ToolStatus, UnifiedMessage};
pub use permission::{
    PermissionDecision, PermissionHandler, PermissionOption, PermissionRequest,
    PermissionResponse,
};
pub use registry::{AgentRegistry, BackendFactory};
pub use traits::{AgentBackend, SessionConfig, SharedBackend};
