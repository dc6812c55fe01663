// ABOUTME: Newline-delimited JSON-RPC frames exchanged with framed-stdio agents.
// ABOUTME: Decodes each line into a closed Frame union; unknown shapes are kept as Unrecognized.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// JSON-RPC request id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: Self::INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }
}

/// One decoded line of the framed wire protocol
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `id` and `method`: the peer expects a reply frame with the same id
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    /// `id` without `method`: answers one of our requests
    Response {
        id: RequestId,
        outcome: Result<Value, RpcError>,
    },
    /// `method` without `id`: fire-and-forget
    Notification { method: String, params: Value },
    /// Valid JSON that matches none of the above
    Unrecognized(Value),
}

impl Frame {
    /// Decode one line. Returns `None` when the line is blank or not JSON.
    pub fn decode(line: &str) -> Option<Frame> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed frame");
                return None;
            }
        };
        Some(Self::from_value(value))
    }

    /// Classify an already-parsed JSON value
    pub fn from_value(value: Value) -> Frame {
        let id = value
            .get("id")
            .filter(|id| !id.is_null())
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
        let method = value.get("method").and_then(Value::as_str).map(str::to_string);
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Frame::Request { id, method, params },
            (None, Some(method)) => Frame::Notification { method, params },
            (Some(id), None) => {
                let outcome = match value.get("error").filter(|e| !e.is_null()) {
                    Some(error) => Err(serde_json::from_value(error.clone()).unwrap_or_else(
                        |_| RpcError::internal(error.to_string()),
                    )),
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                Frame::Response { id, outcome }
            }
            (None, None) => Frame::Unrecognized(value),
        }
    }

    /// Encode as a single JSON line without the trailing newline
    pub fn encode(&self) -> String {
        let value = match self {
            Frame::Request { id, method, params } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            Frame::Response { id, outcome } => match outcome {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
            },
            Frame::Notification { method, params } => json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            Frame::Unrecognized(value) => value.clone(),
        };
        value.to_string()
    }
}
