// ABOUTME: End-to-end tests of the framed-stdio backend against the scripted fake agent.
// ABOUTME: Covers streaming, permissions, elicitation, cancel, crash recovery and fallback launch args.

use serde_json::{json, Value};
use std::sync::Arc;
use switchboard_agent::backends::stdio::{StdioAgent, StdioAgentConfig};
use switchboard_agent::{
    AgentBackend, AgentError, PermissionDecision, PermissionRequest, SessionConfig, StopReason,
    ToolStatus, UnifiedMessage,
};
use tokio::sync::mpsc;

/// `RUST_LOG=switchboard_agent=debug` shows the agent's stderr and the wire traffic
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn agent_config() -> StdioAgentConfig {
    init_tracing();
    let mut config = StdioAgentConfig::new(env!("CARGO_BIN_EXE_fake-acp-agent"));
    config.init_timeout_ms = 5_000;
    config.close_grace_ms = 500;
    config
}

async fn connected(config: StdioAgentConfig) -> (StdioAgent, String) {
    let backend = StdioAgent::new(config).unwrap();
    backend.initialize().await.unwrap();
    let session = backend.new_session(SessionConfig::default()).await.unwrap();
    (backend, session)
}

/// Forward every permission prompt into a channel the test can read
fn capture_permissions(backend: &StdioAgent) -> mpsc::UnboundedReceiver<PermissionRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    backend.on_permission_request(Arc::new(move |request: PermissionRequest| {
        let _ = tx.send(request);
    }));
    rx
}

fn end_turn() -> UnifiedMessage {
    UnifiedMessage::turn_complete(StopReason::EndTurn)
}

#[tokio::test]
async fn test_prompt_streams_text_then_completes() {
    let (backend, session) = connected(agent_config()).await;
    assert!(backend.pid().await.is_some());

    let messages = backend.prompt(&session, "hello there").await.unwrap().collect().await;
    assert_eq!(
        messages,
        vec![UnifiedMessage::text("echo: hello there"), end_turn()]
    );

    // The process is reused for the next turn
    let pid = backend.pid().await;
    let messages = backend.prompt(&session, "again").await.unwrap().collect().await;
    assert_eq!(messages[0], UnifiedMessage::text("echo: again"));
    assert_eq!(backend.pid().await, pid);

    backend.disconnect().await;
}

#[tokio::test]
async fn test_tool_call_lifecycle_is_normalized() {
    let (backend, session) = connected(agent_config()).await;

    let messages = backend.prompt(&session, "use a tool").await.unwrap().collect().await;
    assert_eq!(
        messages,
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
            end_turn(),
        ]
    );

    backend.disconnect().await;
}

#[tokio::test]
async fn test_permission_prompt_is_answered_with_matching_option() {
    let (backend, session) = connected(agent_config()).await;
    let mut requests = capture_permissions(&backend);

    let receiver = backend.prompt(&session, "needs permission").await.unwrap();
    let request = requests.recv().await.unwrap();
    assert_eq!(request.session_id, session);
    assert_eq!(request.title, "Write a.txt");
    assert_eq!(request.tool_call_id.as_deref(), Some("call-2"));
    assert_eq!(request.raw_input, json!({"path": "a.txt"}));
    assert_eq!(request.options.len(), 2);

    assert!(backend.respond_to_permission(&session, &request.id, PermissionDecision::Approved.into()));
    // A prompt settles once
    assert!(!backend.respond_to_permission(&session, &request.id, PermissionDecision::Denied.into()));

    let messages = receiver.collect().await;
    assert_eq!(messages, vec![UnifiedMessage::text("outcome: allow"), end_turn()]);

    backend.disconnect().await;
}

#[tokio::test]
async fn test_denied_permission_selects_reject_option() {
    let (backend, session) = connected(agent_config()).await;
    let mut requests = capture_permissions(&backend);

    let receiver = backend.prompt(&session, "permission please").await.unwrap();
    let request = requests.recv().await.unwrap();
    assert!(backend.respond_to_permission(&session, &request.id, PermissionDecision::Denied.into()));

    let messages = receiver.collect().await;
    assert_eq!(messages[0], UnifiedMessage::text("outcome: reject"));

    backend.disconnect().await;
}

#[tokio::test]
async fn test_permission_without_handler_is_cancelled() {
    let (backend, session) = connected(agent_config()).await;

    let messages = backend.prompt(&session, "permission please").await.unwrap().collect().await;
    assert_eq!(messages, vec![UnifiedMessage::text("outcome: cancelled"), end_turn()]);

    backend.disconnect().await;
}

#[tokio::test]
async fn test_respond_with_wrong_session_is_a_no_op() {
    let (backend, session) = connected(agent_config()).await;
    let mut requests = capture_permissions(&backend);

    let receiver = backend.prompt(&session, "permission please").await.unwrap();
    let request = requests.recv().await.unwrap();
    assert!(!backend.respond_to_permission("other-session", &request.id, PermissionDecision::Approved.into()));
    assert!(!backend.respond_to_permission(&session, "unknown-request", PermissionDecision::Approved.into()));
    assert!(backend.respond_to_permission(&session, &request.id, PermissionDecision::Approved.into()));

    let messages = receiver.collect().await;
    assert_eq!(messages[0], UnifiedMessage::text("outcome: allow"));

    backend.disconnect().await;
}

#[tokio::test]
async fn test_elicitation_answer_fits_requested_schema() {
    let (backend, session) = connected(agent_config()).await;
    let mut requests = capture_permissions(&backend);

    let receiver = backend.prompt(&session, "elicit a confirmation").await.unwrap();
    let request = requests.recv().await.unwrap();
    assert_eq!(request.title, "Proceed with deploy?");
    assert!(request.schema.is_some());
    assert!(backend.respond_to_permission(&session, &request.id, PermissionDecision::Approved.into()));

    let messages = receiver.collect().await;
    let UnifiedMessage::Text { text } = &messages[0] else {
        panic!("Expected text, got {:?}", messages[0]);
    };
    let answer: Value = serde_json::from_str(text).unwrap();
    assert_eq!(answer["action"], "accept");
    assert_eq!(answer["content"]["confirm"], json!(true));

    backend.disconnect().await;
}

#[tokio::test]
async fn test_cancel_settles_once_and_session_stays_usable() {
    let (backend, session) = connected(agent_config()).await;

    let receiver = backend.prompt(&session, "please hang").await.unwrap();
    let second = backend.prompt(&session, "in parallel").await;
    assert!(matches!(second, Err(AgentError::PromptInFlight(_))));

    backend.cancel_prompt(&session).await.unwrap();
    let messages = receiver.collect().await;
    assert_eq!(
        messages,
        vec![UnifiedMessage::turn_complete(StopReason::Cancelled)]
    );

    // Cancelling again is harmless
    backend.cancel_prompt(&session).await.unwrap();

    let messages = backend.prompt(&session, "next").await.unwrap().collect().await;
    assert_eq!(messages, vec![UnifiedMessage::text("echo: next"), end_turn()]);

    backend.disconnect().await;
}

#[tokio::test]
async fn test_crash_invalidates_sessions_and_relaunches() {
    let (backend, session) = connected(agent_config()).await;
    let first_pid = backend.pid().await;

    let messages = backend.prompt(&session, "crash now").await.unwrap().collect().await;
    assert_eq!(messages.len(), 1);
    assert!(matches!(messages[0], UnifiedMessage::Error { .. }));

    let stale = backend.prompt(&session, "hello").await;
    assert!(matches!(stale, Err(AgentError::SessionInvalid(_))));
    assert_ne!(backend.pid().await, first_pid);

    let fresh = backend.new_session(SessionConfig::default()).await.unwrap();
    let messages = backend.prompt(&fresh, "hello").await.unwrap().collect().await;
    assert_eq!(messages[0], UnifiedMessage::text("echo: hello"));

    backend.disconnect().await;
}

#[tokio::test]
async fn test_fallback_args_are_probed_in_order() {
    let mut config = agent_config();
    config.args = vec!["--exit-early".to_string()];
    config.fallback_args = vec![vec!["--exit-early".to_string()], vec![]];

    let (backend, session) = connected(config).await;
    let messages = backend.prompt(&session, "hi").await.unwrap().collect().await;
    assert_eq!(messages[0], UnifiedMessage::text("echo: hi"));

    backend.disconnect().await;
}

#[tokio::test]
async fn test_failed_launch_reports_stderr() {
    let mut config = agent_config();
    config.args = vec!["--exit-early".to_string()];

    let backend = StdioAgent::new(config).unwrap();
    let err = backend.initialize().await.unwrap_err();
    assert!(matches!(err, AgentError::Initialization(_)));
    assert!(err.to_string().contains("unsupported flag"), "{err}");
}

#[tokio::test]
async fn test_handshake_timeout() {
    let mut config = agent_config();
    config.args = vec!["--hang-init".to_string()];
    config.init_timeout_ms = 200;

    let backend = StdioAgent::new(config).unwrap();
    let err = backend.initialize().await.unwrap_err();
    assert!(matches!(&err, AgentError::Initialization(m) if m.contains("timed out")), "{err}");
}

#[tokio::test]
async fn test_missing_executable_fails_initialization() {
    let backend = StdioAgent::new(StdioAgentConfig::new("/nonexistent/switchboard-agent-binary")).unwrap();
    let err = backend.initialize().await.unwrap_err();
    assert!(matches!(err, AgentError::Initialization(_)));
}

#[tokio::test]
async fn test_authentication_failure_carries_hint() {
    let mut config = agent_config();
    config
        .env
        .insert("FAKE_AGENT_AUTH_FAIL".to_string(), "1".to_string());

    let backend = StdioAgent::new(config).unwrap();
    let err = backend.new_session(SessionConfig::default()).await.unwrap_err();
    match &err {
        AgentError::SessionCreation { message, hint } => {
            assert!(message.contains("Authentication required"));
            assert!(hint.is_some());
        }
        other => panic!("Expected SessionCreation, got {other:?}"),
    }

    backend.disconnect().await;
}

#[tokio::test]
async fn test_model_change_relaunches_agent() {
    let mut config = agent_config();
    config.model = Some("alpha".to_string());
    config.model_env = Some("FAKE_AGENT_MODEL".to_string());

    let (backend, session) = connected(config).await;
    assert_eq!(backend.model().as_deref(), Some("alpha"));
    let messages = backend.prompt(&session, "which model").await.unwrap().collect().await;
    assert_eq!(messages[0], UnifiedMessage::text("model: alpha"));

    let old_pid = backend.pid().await;
    backend.set_model("beta").await.unwrap();
    assert_eq!(backend.model().as_deref(), Some("beta"));
    assert_ne!(backend.pid().await, old_pid);

    let stale = backend.prompt(&session, "which model").await;
    assert!(matches!(stale, Err(AgentError::SessionInvalid(_))));

    let session = backend.new_session(SessionConfig::default()).await.unwrap();
    let messages = backend.prompt(&session, "which model").await.unwrap().collect().await;
    assert_eq!(messages[0], UnifiedMessage::text("model: beta"));

    backend.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_ends_streams_and_refuses_new_work() {
    let (backend, session) = connected(agent_config()).await;

    let receiver = backend.prompt(&session, "please hang").await.unwrap();
    backend.disconnect().await;
    assert_eq!(
        receiver.collect().await,
        vec![UnifiedMessage::turn_complete(StopReason::Cancelled)]
    );
    assert!(backend.pid().await.is_none());

    assert!(backend.new_session(SessionConfig::default()).await.is_err());
    // Idempotent
    backend.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_answers_pending_permission_before_closing() {
    let dir = tempfile::tempdir().unwrap();
    let record = dir.path().join("outcome.txt");
    let mut config = agent_config();
    config
        .env
        .insert("FAKE_AGENT_RECORD".into(), record.to_string_lossy().into_owned());
    let (backend, session) = connected(config).await;
    let mut requests = capture_permissions(&backend);

    let receiver = backend.prompt(&session, "permission please").await.unwrap();
    let request = requests.recv().await.unwrap();
    backend.disconnect().await;

    assert_eq!(
        receiver.collect().await,
        vec![UnifiedMessage::turn_complete(StopReason::Cancelled)]
    );
    assert!(!backend.respond_to_permission(&session, &request.id, PermissionDecision::Approved.into()));
    assert_eq!(std::fs::read_to_string(&record).unwrap(), "cancelled");
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let (backend, _session) = connected(agent_config()).await;
    let result = backend.prompt("no-such-session", "hello").await;
    assert!(matches!(result, Err(AgentError::UnknownSession(_))));
    backend.disconnect().await;
}
