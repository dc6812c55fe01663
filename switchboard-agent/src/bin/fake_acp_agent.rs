// ABOUTME: Scripted framed-stdio agent used by the integration tests.
// ABOUTME: Behaviour is chosen by launch flags and by keywords in the prompt text.

use serde_json::{json, Value};
use std::io::{self, BufRead, Write};

type Lines<'a> = io::Lines<io::StdinLock<'a>>;

fn send(message: Value) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{message}");
    let _ = out.flush();
}

fn reply(id: Value, result: Value) {
    send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn reply_error(id: Value, code: i64, message: &str) {
    send(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}));
}

fn update(session_id: &str, update: Value) {
    send(json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {"sessionId": session_id, "update": update}
    }));
}

fn chunk(session_id: &str, text: &str) {
    update(
        session_id,
        json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": text}}),
    );
}

/// Send a request to the client and block until its response arrives
fn ask(lines: &mut Lines<'_>, id: &str, method: &str, params: Value) -> Value {
    send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}));
    for line in lines.by_ref() {
        let Ok(line) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if message.get("id").and_then(Value::as_str) == Some(id) && message.get("method").is_none() {
            return message.get("result").cloned().unwrap_or(Value::Null);
        }
    }
    Value::Null
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--exit-early") {
        eprintln!("fake-acp-agent: unsupported flag --exit-early");
        std::process::exit(2);
    }
    let hang_init = args.iter().any(|a| a == "--hang-init");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut session_count = 0;
    let mut hanging: Option<Value> = None;

    while let Some(Ok(line)) = lines.next() {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let id = message.get("id").cloned();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match (method, id) {
            ("initialize", Some(_)) if hang_init => {}
            ("initialize", Some(id)) => {
                eprintln!("fake-acp-agent: initialized");
                reply(id, json!({"protocolVersion": 1, "agentCapabilities": {}}));
            }
            ("session/new", Some(id)) => {
                if std::env::var("FAKE_AGENT_AUTH_FAIL").is_ok() {
                    reply_error(id, -32000, "Authentication required: run login first");
                    continue;
                }
                session_count += 1;
                reply(id, json!({"sessionId": format!("fake-{session_count}")}));
            }
            ("session/prompt", Some(id)) => {
                let session_id = params["sessionId"].as_str().unwrap_or_default().to_string();
                let text = params["prompt"][0]["text"].as_str().unwrap_or_default().to_string();

                if text.contains("crash") {
                    std::process::exit(3);
                } else if text.contains("hang") {
                    hanging = Some(id);
                    continue;
                } else if text.contains("tool") {
                    update(
                        &session_id,
                        json!({
                            "sessionUpdate": "tool_call",
                            "toolCallId": "call-1",
                            "title": "calculator",
                            "rawInput": {"expr": "6*7"},
                            "status": "in_progress"
                        }),
                    );
                    update(
                        &session_id,
                        json!({
                            "sessionUpdate": "tool_call_update",
                            "toolCallId": "call-1",
                            "status": "completed",
                            "rawOutput": "42"
                        }),
                    );
                } else if text.contains("permission") {
                    let result = ask(
                        &mut lines,
                        "perm-1",
                        "session/request_permission",
                        json!({
                            "sessionId": session_id,
                            "toolCall": {
                                "toolCallId": "call-2",
                                "title": "Write a.txt",
                                "kind": "edit",
                                "rawInput": {"path": "a.txt"}
                            },
                            "options": [
                                {"optionId": "allow", "name": "Allow", "kind": "allow_once"},
                                {"optionId": "reject", "name": "Reject", "kind": "reject_once"}
                            ]
                        }),
                    );
                    let outcome = result["outcome"]["optionId"]
                        .as_str()
                        .or_else(|| result["outcome"]["outcome"].as_str())
                        .unwrap_or("none")
                        .to_string();
                    if let Ok(path) = std::env::var("FAKE_AGENT_RECORD") {
                        let _ = std::fs::write(path, &outcome);
                    }
                    chunk(&session_id, &format!("outcome: {outcome}"));
                } else if text.contains("elicit") {
                    let result = ask(
                        &mut lines,
                        "elicit-1",
                        "elicitation/create",
                        json!({
                            "sessionId": session_id,
                            "message": "Proceed with deploy?",
                            "requestedSchema": {
                                "type": "object",
                                "properties": {"confirm": {"type": "boolean"}},
                                "required": ["confirm"]
                            }
                        }),
                    );
                    chunk(&session_id, &result.to_string());
                } else if text.contains("model") {
                    let model = std::env::var("FAKE_AGENT_MODEL").unwrap_or_else(|_| "none".into());
                    chunk(&session_id, &format!("model: {model}"));
                } else {
                    chunk(&session_id, &format!("echo: {text}"));
                }
                reply(id, json!({"stopReason": "end_turn"}));
            }
            ("session/cancel", None) => {
                if let Some(id) = hanging.take() {
                    reply(id, json!({"stopReason": "cancelled"}));
                }
            }
            (_, Some(id)) if !method.is_empty() => reply_error(id, -32601, "method not found"),
            _ => {}
        }
    }
}
