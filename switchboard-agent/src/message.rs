// ABOUTME: Unified message vocabulary emitted by every backend while a prompt streams.
// ABOUTME: Closed set: text, reasoning, tool_call, tool_result, turn_complete, error.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Messages pushed onto a prompt's output channel.
///
/// This is the only vocabulary consumers (UI, chat bridges, audit) should
/// depend on. A prompt's stream ends after `TurnComplete` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedMessage {
    /// Streaming assistant text chunk
    Text { text: String },

    /// Streaming reasoning/thought chunk
    Reasoning { text: String },

    /// A tool call appeared or changed state
    ToolCall {
        /// Unique identifier for this tool invocation
        id: String,
        /// Tool name or title as reported by the backend
        name: String,
        /// Input passed to the tool
        input: Value,
        status: ToolStatus,
    },

    /// Output of a finished tool call
    ToolResult {
        /// Matches the id from ToolCall
        id: String,
        output: Value,
        status: ToolStatus,
    },

    /// The turn finished; nothing further will be pushed for this prompt
    TurnComplete {
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
    },

    /// The turn failed; nothing further will be pushed for this prompt
    Error { message: String },
}

impl UnifiedMessage {
    pub fn text(text: impl Into<String>) -> Self {
        UnifiedMessage::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        UnifiedMessage::Reasoning { text: text.into() }
    }

    pub fn turn_complete(stop_reason: StopReason) -> Self {
        UnifiedMessage::TurnComplete { stop_reason }
    }

    pub fn error(message: impl Into<String>) -> Self {
        UnifiedMessage::Error {
            message: message.into(),
        }
    }

    /// Whether this message ends a prompt's stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnifiedMessage::TurnComplete { .. } | UnifiedMessage::Error { .. }
        )
    }
}

/// Unified tool-call lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ToolStatus {
    /// Map a backend status word onto the unified lifecycle.
    ///
    /// Accepts both the HTTP+SSE vocabulary (`pending|running|completed|error`)
    /// and the framed-stdio one (`pending|in_progress|completed|failed`).
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(ToolStatus::Pending),
            "running" | "in_progress" => Some(ToolStatus::InProgress),
            "completed" | "complete" | "success" => Some(ToolStatus::Completed),
            "error" | "failed" => Some(ToolStatus::Failed),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, ToolStatus::Completed | ToolStatus::Failed)
    }
}

/// Why a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    /// A reason this crate does not know about, kept verbatim
    Other(String),
}

impl StopReason {
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "max_turn_requests" => StopReason::MaxTurnRequests,
            "refusal" => StopReason::Refusal,
            "cancelled" | "canceled" => StopReason::Cancelled,
            other => StopReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::MaxTurnRequests => "max_turn_requests",
            StopReason::Refusal => "refusal",
            StopReason::Cancelled => "cancelled",
            StopReason::Other(reason) => reason,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StopReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let reason = String::deserialize(deserializer)?;
        Ok(StopReason::from_wire(&reason))
    }
}
