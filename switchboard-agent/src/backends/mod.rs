// ABOUTME: Backend implementations (framed stdio, HTTP+SSE, mock).
// ABOUTME: Each backend implements the AgentBackend trait.

pub mod mock;
pub mod probe;
pub mod stdio;

#[cfg(feature = "http")]
pub mod http_sse;
