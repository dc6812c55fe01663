// ABOUTME: Wire-level channels beneath the backend adapters.
// ABOUTME: Framed JSON-RPC over stdio, and HTTP control calls plus an SSE event stream.

pub mod frame;
pub mod sse;
pub mod stdio;

#[cfg(feature = "http")]
pub mod http;

pub use frame::{Frame, RequestId, RpcError};
pub use stdio::{FramedConnection, FramedStdioTransport, InboundHandler, LaunchSpec};

#[cfg(feature = "http")]
pub use http::HttpSseTransport;
