// ABOUTME: Maps backend-native streaming payloads onto the closed UnifiedMessage set.
// ABOUTME: Tracks tool-call state per prompt; unknown payload kinds are dropped, never errors.

use crate::message::{StopReason, ToolStatus, UnifiedMessage};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

const TOOL_FAILED: &str = "Tool execution failed";

/// Tool-call fields as they appear in framed-stdio `tool_call` / `tool_call_update`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFields {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub raw_input: Option<Value>,
    #[serde(default)]
    pub raw_output: Option<Value>,
    #[serde(default)]
    pub content: Option<Vec<Value>>,
}

/// A framed-stdio `session/update` payload, decoded at the boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    AgentMessageChunk(String),
    AgentThoughtChunk(String),
    ToolCall(ToolCallFields),
    ToolCallUpdate(ToolCallFields),
    /// Some agents report the stop reason as an update instead of in the prompt response
    TurnComplete(StopReason),
    /// Any other kind (plans, mode changes, user echoes, ...)
    Unrecognized(String),
}

impl SessionUpdate {
    /// Decode the `update` object of a `session/update` notification
    pub fn decode(update: &Value) -> SessionUpdate {
        let kind = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match kind {
            "agent_message_chunk" => {
                SessionUpdate::AgentMessageChunk(content_text(update.get("content")))
            }
            "agent_thought_chunk" => {
                SessionUpdate::AgentThoughtChunk(content_text(update.get("content")))
            }
            "tool_call" | "tool_call_update" => {
                match serde_json::from_value::<ToolCallFields>(update.clone()) {
                    Ok(fields) if kind == "tool_call" => SessionUpdate::ToolCall(fields),
                    Ok(fields) => SessionUpdate::ToolCallUpdate(fields),
                    Err(e) => {
                        tracing::debug!(error = %e, kind, "Dropping malformed tool call update");
                        SessionUpdate::Unrecognized(kind.to_string())
                    }
                }
            }
            _ => match update.get("stopReason").and_then(Value::as_str) {
                Some(reason) => SessionUpdate::TurnComplete(StopReason::from_wire(reason)),
                None => SessionUpdate::Unrecognized(kind.to_string()),
            },
        }
    }
}

/// Text of a content block; non-text blocks get a short placeholder
fn content_text(content: Option<&Value>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    match content.get("type").and_then(Value::as_str) {
        Some("text") => content
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some("image") => "<image>".into(),
        Some("audio") => "<audio>".into(),
        Some("resource_link") => content
            .get("uri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some("resource") => "<resource>".into(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone)]
struct ToolState {
    name: String,
    input: Value,
    status: Option<ToolStatus>,
}

/// Per-prompt normalizer state
#[derive(Debug, Default)]
pub struct UpdateNormalizer {
    tools: HashMap<String, ToolState>,
    /// Bytes of cumulative part text already emitted, keyed by part id
    part_progress: HashMap<String, usize>,
    user_messages: HashSet<String>,
}

impl UpdateNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one framed-stdio session update
    pub fn session_update(&mut self, update: SessionUpdate) -> Vec<UnifiedMessage> {
        match update {
            SessionUpdate::AgentMessageChunk(text) if !text.is_empty() => {
                vec![UnifiedMessage::text(text)]
            }
            SessionUpdate::AgentThoughtChunk(text) if !text.is_empty() => {
                vec![UnifiedMessage::reasoning(text)]
            }
            SessionUpdate::ToolCall(fields) => self.tool_fields(fields, true),
            SessionUpdate::ToolCallUpdate(fields) => self.tool_fields(fields, false),
            SessionUpdate::Unrecognized(kind) => {
                tracing::trace!(%kind, "Dropping unhandled session update");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// A missing status means pending for an announced or first-seen call, unchanged otherwise
    fn tool_fields(&mut self, fields: ToolCallFields, announced: bool) -> Vec<UnifiedMessage> {
        let known = self.tools.contains_key(&fields.tool_call_id);
        let status = fields
            .status
            .as_deref()
            .and_then(ToolStatus::from_wire)
            .or_else(|| (announced || !known).then_some(ToolStatus::Pending));
        let output = fields
            .raw_output
            .clone()
            .or_else(|| content_output(fields.content.as_deref()));
        self.tool_transition(fields.tool_call_id, fields.title, fields.raw_input, status, output)
    }

    /// Remember that a message id was authored by the user
    pub fn note_user_message(&mut self, message_id: &str) {
        self.user_messages.insert(message_id.to_string());
    }

    /// Normalize one HTTP+SSE message part (`message.part.updated`)
    pub fn message_part(&mut self, part: &Value, delta: Option<&str>) -> Vec<UnifiedMessage> {
        if let Some(message_id) = part.get("messageID").and_then(Value::as_str) {
            if self.user_messages.contains(message_id) {
                return Vec::new();
            }
        }

        match part.get("type").and_then(Value::as_str) {
            Some("text") => self
                .text_delta(part, delta)
                .map(UnifiedMessage::text)
                .into_iter()
                .collect(),
            Some("reasoning") => self
                .text_delta(part, delta)
                .map(UnifiedMessage::reasoning)
                .into_iter()
                .collect(),
            Some("tool") => {
                let id = part
                    .get("callID")
                    .or_else(|| part.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if id.is_empty() {
                    return Vec::new();
                }
                let name = part.get("tool").and_then(Value::as_str).map(str::to_string);
                let state = part.get("state").cloned().unwrap_or(Value::Null);
                let status = state
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(ToolStatus::from_wire);
                let input = state.get("input").cloned();
                let output = match status {
                    Some(ToolStatus::Failed) => state.get("error").cloned(),
                    _ => state.get("output").cloned(),
                };
                self.tool_transition(id, name, input, status, output)
            }
            other => {
                tracing::trace!(kind = ?other, "Dropping unhandled message part");
                Vec::new()
            }
        }
    }

    /// Text to emit for a part: the explicit delta, or the unseen suffix of cumulative text
    fn text_delta(&mut self, part: &Value, delta: Option<&str>) -> Option<String> {
        let part_id = part.get("id").and_then(Value::as_str).unwrap_or_default();
        let full = part.get("text").and_then(Value::as_str);

        let emitted = match (delta, full) {
            (Some(delta), full) => {
                let progress = self.part_progress.entry(part_id.to_string()).or_default();
                *progress = full.map(str::len).unwrap_or(*progress + delta.len());
                delta.to_string()
            }
            (None, Some(full)) => {
                let progress = self.part_progress.entry(part_id.to_string()).or_default();
                let unseen = full.get(*progress..).unwrap_or_default().to_string();
                *progress = full.len();
                unseen
            }
            (None, None) => String::new(),
        };

        (!emitted.is_empty()).then_some(emitted)
    }

    fn tool_transition(
        &mut self,
        id: String,
        name: Option<String>,
        input: Option<Value>,
        status: Option<ToolStatus>,
        output: Option<Value>,
    ) -> Vec<UnifiedMessage> {
        let state = self.tools.entry(id.clone()).or_insert_with(|| ToolState {
            name: String::new(),
            input: Value::Null,
            status: None,
        });
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            state.name = name;
        }
        if let Some(input) = input.filter(|i| !i.is_null()) {
            state.input = input;
        }

        let Some(status) = status else {
            return Vec::new();
        };
        if state.status == Some(status) || state.status.is_some_and(ToolStatus::is_finished) {
            return Vec::new();
        }
        if status == ToolStatus::Pending && state.status.is_some() {
            return Vec::new();
        }
        state.status = Some(status);

        let mut messages = vec![UnifiedMessage::ToolCall {
            id: id.clone(),
            name: if state.name.is_empty() {
                "tool".to_string()
            } else {
                state.name.clone()
            },
            input: state.input.clone(),
            status,
        }];

        match status {
            ToolStatus::Completed => messages.push(UnifiedMessage::ToolResult {
                id,
                output: output.unwrap_or(Value::Null),
                status,
            }),
            ToolStatus::Failed => {
                let error = output
                    .as_ref()
                    .and_then(|o| match o {
                        Value::String(s) if !s.is_empty() => Some(s.clone()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .unwrap_or_else(|| TOOL_FAILED.to_string());
                messages.push(UnifiedMessage::ToolResult {
                    id,
                    output: Value::String(error),
                    status,
                });
            }
            _ => {}
        }
        messages
    }
}

/// Join the text blocks of framed-stdio tool content into one output string
fn content_output(content: Option<&[Value]>) -> Option<Value> {
    let content = content?;
    let texts: Vec<String> = content
        .iter()
        .map(|item| match item.get("type").and_then(Value::as_str) {
            Some("content") => content_text(item.get("content")),
            Some("diff") => item
                .get("path")
                .and_then(Value::as_str)
                .map(|p| format!("<diff {p}>"))
                .unwrap_or_default(),
            _ => content_text(Some(item)),
        })
        .filter(|t| !t.is_empty())
        .collect();
    (!texts.is_empty()).then(|| Value::String(texts.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_message_and_thought_chunks() {
        let mut normalizer = UpdateNormalizer::new();
        let text = SessionUpdate::decode(&json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "Hello"}
        }));
        assert_eq!(normalizer.session_update(text), vec![UnifiedMessage::text("Hello")]);

        let thought = SessionUpdate::decode(&json!({
            "sessionUpdate": "agent_thought_chunk",
            "content": {"type": "text", "text": "hmm"}
        }));
        assert_eq!(normalizer.session_update(thought), vec![UnifiedMessage::reasoning("hmm")]);
    }

    #[test]
    fn test_unknown_kinds_are_dropped() {
        let mut normalizer = UpdateNormalizer::new();
        let plan = SessionUpdate::decode(&json!({"sessionUpdate": "plan", "entries": []}));
        assert_eq!(plan, SessionUpdate::Unrecognized("plan".into()));
        assert!(normalizer.session_update(plan).is_empty());

        let broken = SessionUpdate::decode(&json!({"sessionUpdate": "tool_call"}));
        assert!(matches!(broken, SessionUpdate::Unrecognized(_)));
    }

    #[test]
    fn test_stop_reason_update() {
        let update = SessionUpdate::decode(&json!({"sessionUpdate": "turn_end", "stopReason": "max_tokens"}));
        assert_eq!(update, SessionUpdate::TurnComplete(StopReason::MaxTokens));
    }

    #[test]
    fn test_tool_call_running_then_completed() {
        let mut normalizer = UpdateNormalizer::new();
        let start = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "call-1",
            "title": "calculator",
            "rawInput": {"expr": "6*7"},
            "status": "running"
        }));
        let done = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "call-1",
            "status": "completed",
            "rawOutput": "42"
        }));

        let mut out = normalizer.session_update(start);
        out.extend(normalizer.session_update(done));
        assert_eq!(
            out,
            vec![
                UnifiedMessage::ToolCall {
                    id: "call-1".into(),
                    name: "calculator".into(),
                    input: json!({"expr": "6*7"}),
                    status: ToolStatus::InProgress,
                },
                UnifiedMessage::ToolCall {
                    id: "call-1".into(),
                    name: "calculator".into(),
                    input: json!({"expr": "6*7"}),
                    status: ToolStatus::Completed,
                },
                UnifiedMessage::ToolResult {
                    id: "call-1".into(),
                    output: json!("42"),
                    status: ToolStatus::Completed,
                },
            ]
        );
    }

    #[test]
    fn test_tool_content_output_and_failure_fallback() {
        let mut normalizer = UpdateNormalizer::new();
        let ok = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "c1",
            "title": "Read",
            "status": "completed",
            "content": [{"type": "content", "content": {"type": "text", "text": "file body"}}]
        }));
        let out = normalizer.session_update(ok);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], UnifiedMessage::ToolResult { output, .. } if output == &json!("file body")));

        let failed = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "c2",
            "title": "Bash",
            "status": "failed"
        }));
        let out = normalizer.session_update(failed);
        assert_eq!(
            out[1],
            UnifiedMessage::ToolResult {
                id: "c2".into(),
                output: json!(TOOL_FAILED),
                status: ToolStatus::Failed,
            }
        );
    }

    #[test]
    fn test_repeated_status_is_not_re_emitted() {
        let mut normalizer = UpdateNormalizer::new();
        let update = json!({"sessionUpdate": "tool_call_update", "toolCallId": "c1", "status": "in_progress"});
        assert_eq!(normalizer.session_update(SessionUpdate::decode(&update)).len(), 1);
        assert!(normalizer.session_update(SessionUpdate::decode(&update)).is_empty());
    }

    #[test]
    fn test_update_without_status_keeps_current_status() {
        let mut normalizer = UpdateNormalizer::new();
        let running = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "c1",
            "title": "Bash",
            "status": "in_progress"
        }));
        let progress = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "c1",
            "content": [{"type": "content", "content": {"type": "text", "text": "partial"}}]
        }));
        let done = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "c1",
            "status": "completed"
        }));

        assert_eq!(normalizer.session_update(running).len(), 1);
        assert!(normalizer.session_update(progress).is_empty());
        let out = normalizer.session_update(done);
        assert!(matches!(
            &out[0],
            UnifiedMessage::ToolCall { status: ToolStatus::Completed, .. }
        ));

        // A first-seen call announced without a status starts out pending
        let announced = SessionUpdate::decode(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "c2",
            "title": "Read"
        }));
        assert!(matches!(
            normalizer.session_update(announced).as_slice(),
            [UnifiedMessage::ToolCall { status: ToolStatus::Pending, .. }]
        ));
    }

    #[test]
    fn test_http_tool_part_error() {
        let mut normalizer = UpdateNormalizer::new();
        let part = json!({
            "id": "prt_1", "messageID": "msg_1", "type": "tool", "callID": "call_9", "tool": "bash",
            "state": {"status": "error", "input": {"command": "false"}, "error": "exit 1"}
        });
        let out = normalizer.message_part(&part, None);
        assert_eq!(
            out,
            vec![
                UnifiedMessage::ToolCall {
                    id: "call_9".into(),
                    name: "bash".into(),
                    input: json!({"command": "false"}),
                    status: ToolStatus::Failed,
                },
                UnifiedMessage::ToolResult {
                    id: "call_9".into(),
                    output: json!("exit 1"),
                    status: ToolStatus::Failed,
                },
            ]
        );
    }

    #[test]
    fn test_http_text_parts_derive_deltas() {
        let mut normalizer = UpdateNormalizer::new();
        let first = json!({"id": "prt_1", "messageID": "msg_a", "type": "text", "text": "Hel"});
        let second = json!({"id": "prt_1", "messageID": "msg_a", "type": "text", "text": "Hello"});
        assert_eq!(normalizer.message_part(&first, None), vec![UnifiedMessage::text("Hel")]);
        assert_eq!(normalizer.message_part(&second, None), vec![UnifiedMessage::text("lo")]);
        assert!(normalizer.message_part(&second, None).is_empty());

        let with_delta = json!({"id": "prt_2", "messageID": "msg_a", "type": "reasoning", "text": "ab"});
        assert_eq!(
            normalizer.message_part(&with_delta, Some("ab")),
            vec![UnifiedMessage::reasoning("ab")]
        );
    }

    #[test]
    fn test_http_user_parts_are_ignored() {
        let mut normalizer = UpdateNormalizer::new();
        normalizer.note_user_message("msg_user");
        let echo = json!({"id": "prt_0", "messageID": "msg_user", "type": "text", "text": "my prompt"});
        assert!(normalizer.message_part(&echo, None).is_empty());
    }
}
