// ABOUTME: Framed-stdio backend - drives an agent process speaking JSON-RPC on stdin/stdout.
// ABOUTME: Keeps the process alive across prompts, probes fallback args, and relaunches when it dies.

use crate::backends::probe::{probe, LaunchProbe};
use crate::error::{AgentError, Result};
use crate::handle::MessageReceiver;
use crate::message::{StopReason, UnifiedMessage};
use crate::normalize::SessionUpdate;
use crate::permission::{
    coerce_decision, PermissionCorrelator, PermissionDecision, PermissionHandler,
    PermissionOption, PermissionRequest, PermissionResponse,
};
use crate::registry::BackendFactory;
use crate::session::SessionTable;
use crate::traits::{AgentBackend, SessionConfig, SharedBackend};
use crate::transport::{FramedStdioTransport, InboundHandler, LaunchSpec, RpcError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Protocol version sent in the `initialize` handshake
const PROTOCOL_VERSION: u64 = 1;

/// Configuration for a framed-stdio backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioAgentConfig {
    /// Name used in logs and by the registry
    #[serde(default = "default_name")]
    pub name: String,
    /// Agent executable
    pub command: String,
    /// Arguments for the first launch attempt
    #[serde(default)]
    pub args: Vec<String>,
    /// Alternative argument lists, tried in order if `args` fails to initialize
    #[serde(default)]
    pub fallback_args: Vec<Vec<String>>,
    /// Extra environment for the agent process
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable that carries the model; changing the model relaunches the process
    #[serde(default)]
    pub model_env: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,
    /// 0 disables the per-request timeout
    #[serde(default)]
    pub request_timeout_ms: u64,
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,
}

fn default_name() -> String {
    "stdio".to_string()
}

fn default_init_timeout() -> u64 {
    30_000
}

fn default_close_grace() -> u64 {
    2_000
}

impl StdioAgentConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            command: command.into(),
            args: Vec::new(),
            fallback_args: Vec::new(),
            env: HashMap::new(),
            model: None,
            model_env: None,
            cwd: None,
            init_timeout_ms: default_init_timeout(),
            request_timeout_ms: 0,
            close_grace_ms: default_close_grace(),
        }
    }
}

/// State reachable from both the adapter and the inbound handler
struct Shared {
    name: String,
    sessions: Mutex<SessionTable>,
    permissions: PermissionCorrelator,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn invalidate(&self, reason: &str) {
        let sessions = self.sessions().invalidate_all(reason);
        let permissions = self.permissions.cancel_all();
        tracing::info!(
            backend = %self.name,
            sessions,
            permissions,
            "Invalidated sessions of previous agent process"
        );
    }
}

/// Routes agent-initiated traffic: streaming updates and permission prompts
struct InboundRouter {
    shared: Arc<Shared>,
}

impl InboundRouter {
    fn local_session(&self, params: &Value) -> String {
        let remote = params
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.shared
            .sessions()
            .local_id(remote)
            .unwrap_or_else(|| remote.to_string())
    }

    fn permission_prompt(&self, params: Value) -> BoxFuture<'static, std::result::Result<Value, RpcError>> {
        let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
        let options: Vec<PermissionOption> = params
            .get("options")
            .and_then(Value::as_array)
            .map(|options| options.iter().filter_map(parse_option).collect())
            .unwrap_or_default();

        let request = PermissionRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.local_session(&params),
            tool_call_id: str_field(&tool_call, "toolCallId"),
            title: str_field(&tool_call, "title").unwrap_or_else(|| "Permission requested".to_string()),
            kind: str_field(&tool_call, "kind"),
            raw_input: tool_call.get("rawInput").cloned().unwrap_or(Value::Null),
            options: options.clone(),
            schema: None,
        };

        let decision = self.shared.permissions.open(request);
        Box::pin(async move {
            let response = decision
                .await
                .unwrap_or_else(|_| PermissionResponse::cancelled());
            Ok(permission_outcome(&options, response.decision))
        })
    }

    fn elicitation(&self, params: Value) -> BoxFuture<'static, std::result::Result<Value, RpcError>> {
        let schema = params.get("requestedSchema").cloned();
        let request = PermissionRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.local_session(&params),
            tool_call_id: str_field(&params, "toolCallId"),
            title: str_field(&params, "message").unwrap_or_else(|| "Input requested".to_string()),
            kind: Some("elicitation".to_string()),
            raw_input: params.clone(),
            options: Vec::new(),
            schema: schema.clone(),
        };

        let decision = self.shared.permissions.open(request);
        Box::pin(async move {
            let response = decision
                .await
                .unwrap_or_else(|_| PermissionResponse::cancelled());
            let action = match response.decision {
                PermissionDecision::Approved | PermissionDecision::ApprovedForSession => "accept",
                PermissionDecision::Denied => "decline",
                PermissionDecision::Abort => "cancel",
            };
            Ok(json!({
                "action": action,
                "content": coerce_decision(&response, schema.as_ref()),
            }))
        })
    }
}

impl InboundHandler for InboundRouter {
    fn on_notification(&self, method: &str, params: Value) {
        if method != "session/update" {
            tracing::trace!(backend = %self.shared.name, method, "Ignoring notification");
            return;
        }
        let Some(remote) = params.get("sessionId").and_then(Value::as_str) else {
            tracing::debug!("session/update without sessionId");
            return;
        };

        let mut sessions = self.shared.sessions();
        let Some(local) = sessions.local_id(remote) else {
            tracing::debug!(remote_id = %remote, "Update for unknown session");
            return;
        };

        let update = params
            .get("update")
            .map(SessionUpdate::decode)
            .unwrap_or_else(|| SessionUpdate::Unrecognized(String::new()));
        let stop_reason = match &update {
            SessionUpdate::TurnComplete(reason) => Some(reason.clone()),
            _ => params
                .get("stopReason")
                .and_then(Value::as_str)
                .map(StopReason::from_wire),
        };

        let delivered = sessions.with_prompt(&local, |prompt| {
            for message in prompt.normalizer.session_update(update) {
                prompt.push(message);
            }
        });
        if delivered.is_none() {
            tracing::trace!(session_id = %local, "Update outside a prompt, dropping");
        }

        if let Some(reason) = stop_reason {
            sessions.settle(&local, None, UnifiedMessage::turn_complete(reason));
        }
    }

    fn on_request(
        &self,
        method: &str,
        params: Value,
    ) -> BoxFuture<'static, std::result::Result<Value, RpcError>> {
        match method {
            "session/request_permission" => self.permission_prompt(params),
            "elicitation/create" => self.elicitation(params),
            other => {
                let error = RpcError::method_not_found(other);
                Box::pin(async move { Err(error) })
            }
        }
    }

    fn on_closed(&self) {
        tracing::debug!(backend = %self.shared.name, "Agent stdout closed");
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_option(option: &Value) -> Option<PermissionOption> {
    Some(PermissionOption {
        id: str_field(option, "optionId")?,
        name: str_field(option, "name").unwrap_or_default(),
        kind: str_field(option, "kind").unwrap_or_default(),
    })
}

/// Pick the offered option matching a decision, or answer cancelled
fn permission_outcome(options: &[PermissionOption], decision: PermissionDecision) -> Value {
    let preferred: &[&str] = match decision {
        PermissionDecision::Approved => &["allow_once", "allow_always"],
        PermissionDecision::ApprovedForSession => &["allow_always", "allow_once"],
        PermissionDecision::Denied => &["reject_once", "reject_always"],
        PermissionDecision::Abort => &[],
    };
    let chosen = preferred
        .iter()
        .find_map(|kind| options.iter().find(|option| option.kind == *kind));

    match chosen {
        Some(option) => json!({"outcome": {"outcome": "selected", "optionId": option.id}}),
        None => json!({"outcome": {"outcome": "cancelled"}}),
    }
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": {"readTextFile": false, "writeTextFile": false},
            "terminal": false
        },
        "clientInfo": {
            "name": "switchboard",
            "title": "switchboard agent adapter",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

fn handshake_error(error: AgentError, stderr: &[String]) -> AgentError {
    let cause = match error {
        AgentError::Timeout(ms) => format!("handshake timed out after {ms} ms"),
        e if e.is_disconnect() => "agent exited before completing the handshake".to_string(),
        AgentError::Initialization(message) => message,
        other => other.to_string(),
    };
    if stderr.is_empty() {
        AgentError::Initialization(cause)
    } else {
        AgentError::Initialization(format!("{cause}; stderr:\n{}", stderr.join("\n")))
    }
}

/// Spawns the agent with one candidate argument set and runs `initialize`
struct Launcher {
    base: LaunchSpec,
    handler: Arc<dyn InboundHandler>,
    close_grace: Duration,
    init_timeout_ms: f64,
}

#[async_trait]
impl LaunchProbe for Launcher {
    type Connection = FramedStdioTransport;

    async fn launch(&self, args: &[String]) -> Result<FramedStdioTransport> {
        let spec = LaunchSpec {
            args: args.to_vec(),
            ..self.base.clone()
        };
        FramedStdioTransport::start(&spec, Arc::clone(&self.handler), self.close_grace)
    }

    async fn handshake(&self, transport: &FramedStdioTransport) -> Result<()> {
        let outcome = transport
            .request_with_timeout("initialize", initialize_params(), self.init_timeout_ms)
            .await;
        match outcome {
            Ok(response) if response.is_object() => {
                tracing::info!(
                    pid = ?transport.pid(),
                    protocol_version = ?response.get("protocolVersion"),
                    "Agent connection initialized"
                );
                Ok(())
            }
            Ok(other) => Err(AgentError::Initialization(format!(
                "malformed initialize response: {other}"
            ))),
            Err(e) => {
                transport.close().await;
                Err(handshake_error(e, &transport.stderr_tail()))
            }
        }
    }

    async fn close(&self, transport: FramedStdioTransport) {
        transport.close().await;
    }
}

/// Backend for agents speaking framed JSON-RPC over stdio
pub struct StdioAgent {
    config: StdioAgentConfig,
    model: Mutex<Option<String>>,
    shared: Arc<Shared>,
    /// Held across launches and relaunches
    transport: tokio::sync::Mutex<Option<Arc<FramedStdioTransport>>>,
    /// The transport currently in the slot, readable without waiting on a launch
    live: Mutex<Option<Arc<FramedStdioTransport>>>,
    disposed: AtomicBool,
}

impl StdioAgent {
    pub fn new(config: StdioAgentConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(AgentError::Config("stdio backend needs a command".to_string()));
        }
        Ok(Self {
            model: Mutex::new(config.model.clone()),
            shared: Arc::new(Shared {
                name: config.name.clone(),
                sessions: Mutex::new(SessionTable::new()),
                permissions: PermissionCorrelator::new(),
            }),
            transport: tokio::sync::Mutex::new(None),
            live: Mutex::new(None),
            disposed: AtomicBool::new(false),
            config,
        })
    }

    /// Factory function for the registry
    pub fn factory() -> BackendFactory {
        Box::new(|config| {
            let cfg: StdioAgentConfig = serde_json::from_value(config.clone())
                .map_err(|e| AgentError::Config(e.to_string()))?;
            let backend: SharedBackend = Arc::new(StdioAgent::new(cfg)?);
            Ok(backend)
        })
    }

    /// Process id of the current agent process, if one is running
    pub async fn pid(&self) -> Option<u32> {
        self.live_transport().and_then(|t| t.pid())
    }

    fn publish(&self, transport: Option<Arc<FramedStdioTransport>>) {
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = transport;
    }

    fn live_transport(&self) -> Option<Arc<FramedStdioTransport>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn request_timeout(&self) -> f64 {
        self.config.request_timeout_ms as f64
    }

    fn launch_spec(&self) -> LaunchSpec {
        let mut env = self.config.env.clone();
        if let (Some(var), Some(model)) = (&self.config.model_env, self.model()) {
            env.insert(var.clone(), model);
        }
        LaunchSpec {
            command: self.config.command.clone(),
            args: Vec::new(),
            env,
            cwd: self.config.cwd.clone(),
        }
    }

    async fn launch(&self) -> Result<FramedStdioTransport> {
        let mut candidates = vec![self.config.args.clone()];
        candidates.extend(self.config.fallback_args.iter().cloned());

        let launcher = Launcher {
            base: self.launch_spec(),
            handler: Arc::new(InboundRouter {
                shared: Arc::clone(&self.shared),
            }),
            close_grace: Duration::from_millis(self.config.close_grace_ms),
            init_timeout_ms: self.config.init_timeout_ms as f64,
        };
        probe(&launcher, &candidates).await
    }

    /// Current transport, relaunching the agent if its process has died.
    ///
    /// A relaunch invalidates every session created on the old process.
    async fn connection(&self) -> Result<Arc<FramedStdioTransport>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AgentError::TransportClosed);
        }

        let mut slot = self.transport.lock().await;
        if let Some(transport) = slot.as_ref() {
            if transport.is_alive() {
                return Ok(Arc::clone(transport));
            }
        }
        if let Some(dead) = slot.take() {
            self.publish(None);
            tracing::warn!(backend = %self.config.name, pid = ?dead.pid(), "Agent process is gone, reconnecting");
            dead.close().await;
            self.shared
                .invalidate("agent process exited; create a new session");
        }

        let transport = Arc::new(self.launch().await?);
        *slot = Some(Arc::clone(&transport));
        self.publish(Some(Arc::clone(&transport)));
        Ok(transport)
    }
}

impl AgentBackend for StdioAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn initialize<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.connection().await?;
            Ok(())
        })
    }

    fn new_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let transport = self.connection().await?;

            let cwd = match config.cwd.or_else(|| self.config.cwd.clone()) {
                Some(cwd) => cwd,
                None => std::env::current_dir()?,
            };
            let model = config.model.or_else(|| self.model());
            let mut params = json!({
                "cwd": cwd.to_string_lossy(),
                "mcpServers": config.mcp_servers,
            });
            if let Some(model) = &model {
                params["model"] = json!(model);
            }

            let response = transport
                .request_with_timeout("session/new", params, self.request_timeout())
                .await
                .map_err(|e| match e {
                    AgentError::Rpc { message, .. } => AgentError::session_creation(message),
                    other => other,
                })?;

            if let Some(error) = response.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(AgentError::session_creation(message));
            }
            let remote_id = response
                .get("sessionId")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentError::Protocol("session/new returned no sessionId".to_string()))?;

            let session_id = self.shared.sessions().insert(remote_id, model);
            tracing::info!(backend = %self.config.name, %session_id, %remote_id, "Created session");
            Ok(session_id)
        })
    }

    fn prompt<'a>(
        &'a self,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageReceiver>> {
        Box::pin(async move {
            let transport = self.connection().await?;
            let start = self.shared.sessions().begin_prompt(session_id)?;

            tracing::debug!(%session_id, turn_id = start.turn_id, prompt_len = text.len(), "Sending prompt");
            let params = json!({
                "sessionId": start.remote_id,
                "prompt": [{"type": "text", "text": text}],
            });
            let shared = Arc::clone(&self.shared);
            let local = session_id.to_string();
            let remote = start.remote_id.clone();
            let turn_id = start.turn_id;
            let cancel = start.cancel.clone();
            let timeout_ms = self.request_timeout();

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    outcome = transport.request_with_timeout("session/prompt", params, timeout_ms) => outcome,
                    _ = cancel.cancelled() => return,
                };
                let terminal = match outcome {
                    Ok(response) => UnifiedMessage::turn_complete(
                        response
                            .get("stopReason")
                            .and_then(Value::as_str)
                            .map(StopReason::from_wire)
                            .unwrap_or(StopReason::EndTurn),
                    ),
                    Err(e) => {
                        tracing::warn!(session_id = %local, error = %e, "Prompt failed");
                        if matches!(e, AgentError::Timeout(_)) {
                            let _ = transport
                                .notify("session/cancel", json!({"sessionId": remote}))
                                .await;
                        }
                        UnifiedMessage::error(e.to_string())
                    }
                };
                shared.sessions().settle(&local, Some(turn_id), terminal);
            });

            Ok(start.receiver)
        })
    }

    fn cancel_prompt<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let remote_id = self.shared.sessions().remote_id(session_id)?;
            let in_flight = self
                .shared
                .sessions()
                .get(session_id)
                .and_then(|s| s.in_flight())
                .is_some();

            let permissions = self.shared.permissions.cancel_session(session_id);
            if !in_flight {
                tracing::debug!(%session_id, "Cancel with no prompt in flight");
                return Ok(());
            }

            match self.live_transport() {
                Some(transport) => {
                    if let Err(e) = transport
                        .notify("session/cancel", json!({"sessionId": remote_id}))
                        .await
                    {
                        tracing::warn!(%session_id, error = %e, "Failed to send session/cancel");
                    }
                }
                None => {
                    tracing::warn!(%session_id, "No agent connection, session/cancel not sent");
                }
            }

            self.shared.sessions().settle(
                session_id,
                None,
                UnifiedMessage::turn_complete(StopReason::Cancelled),
            );
            tracing::info!(%session_id, permissions, "Prompt cancelled");
            Ok(())
        })
    }

    fn respond_to_permission(
        &self,
        session_id: &str,
        request_id: &str,
        response: PermissionResponse,
    ) -> bool {
        self.shared.permissions.respond(session_id, request_id, response)
    }

    fn on_permission_request(&self, handler: PermissionHandler) {
        self.shared.permissions.set_handler(handler);
    }

    fn disconnect<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            let sessions = self.shared.sessions().dispose_all();
            let permissions = self.shared.permissions.cancel_all();
            self.publish(None);
            let transport = self.transport.lock().await.take();
            if let Some(transport) = transport {
                transport.close().await;
            }
            tracing::info!(backend = %self.config.name, sessions, permissions, "Backend disconnected");
        })
    }

    fn model(&self) -> Option<String> {
        self.model.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(AgentError::TransportClosed);
            }
            *self.model.lock().unwrap_or_else(|e| e.into_inner()) = Some(model.to_string());
            self.shared.sessions().set_model(Some(model.to_string()));

            if self.config.model_env.is_none() {
                return Ok(());
            }

            let mut slot = self.transport.lock().await;
            let Some(old) = slot.take() else {
                return Ok(());
            };
            self.publish(None);
            tracing::info!(backend = %self.config.name, %model, "Relaunching agent for model change");
            old.close().await;
            self.shared
                .invalidate("agent relaunched for a model change; create a new session");

            let transport = Arc::new(self.launch().await?);
            *slot = Some(Arc::clone(&transport));
            self.publish(Some(transport));
            Ok(())
        })
    }
}
