// ABOUTME: HTTP+SSE backend - drives an agent server through REST control calls and one event stream.
// ABOUTME: Push events are routed by session id; `session.idle` ends a turn, `session.error` fails it.

use crate::error::{AgentError, Result};
use crate::handle::MessageReceiver;
use crate::message::{StopReason, UnifiedMessage};
use crate::permission::{
    PermissionCorrelator, PermissionDecision, PermissionHandler, PermissionOption,
    PermissionRequest, PermissionResponse,
};
use crate::registry::BackendFactory;
use crate::session::SessionTable;
use crate::traits::{AgentBackend, SessionConfig, SharedBackend};
use crate::transport::HttpSseTransport;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Configuration for an HTTP+SSE backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSseAgentConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Server root, e.g. `http://127.0.0.1:4096`
    pub base_url: String,
    /// Project directory sent with every call
    #[serde(default)]
    pub directory: Option<String>,
    /// `provider/model`
    #[serde(default)]
    pub model: Option<String>,
    /// 0 disables the timeout on control calls
    #[serde(default)]
    pub request_timeout_ms: u64,
}

fn default_name() -> String {
    "http-sse".to_string()
}

/// One push event, decoded at the transport boundary
#[derive(Debug, Clone, PartialEq)]
enum ServerEvent {
    PartUpdated {
        session_id: String,
        part: Value,
        delta: Option<String>,
    },
    MessageUpdated {
        session_id: String,
        message_id: String,
        role: String,
    },
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: Option<String>,
        message: String,
    },
    PermissionUpdated {
        session_id: String,
        permission: Value,
    },
    PermissionReplied {
        permission_id: String,
    },
    Unrecognized(String),
}

impl ServerEvent {
    fn decode(payload: &Value) -> ServerEvent {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let props = payload.get("properties").cloned().unwrap_or(Value::Null);
        let session_of = |value: &Value| str_field(value, "sessionID");

        let decoded = match kind {
            "message.part.updated" => props.get("part").and_then(|part| {
                Some(ServerEvent::PartUpdated {
                    session_id: session_of(part)?,
                    part: part.clone(),
                    delta: str_field(&props, "delta"),
                })
            }),
            "message.updated" => props.get("info").and_then(|info| {
                Some(ServerEvent::MessageUpdated {
                    session_id: session_of(info)?,
                    message_id: str_field(info, "id")?,
                    role: str_field(info, "role").unwrap_or_default(),
                })
            }),
            "session.idle" => session_of(&props).map(|session_id| ServerEvent::SessionIdle { session_id }),
            "session.error" => Some(ServerEvent::SessionError {
                session_id: session_of(&props),
                message: error_message(props.get("error")),
            }),
            "permission.updated" => session_of(&props).map(|session_id| ServerEvent::PermissionUpdated {
                session_id,
                permission: props.clone(),
            }),
            "permission.replied" => str_field(&props, "permissionID")
                .map(|permission_id| ServerEvent::PermissionReplied { permission_id }),
            _ => None,
        };
        decoded.unwrap_or_else(|| ServerEvent::Unrecognized(kind.to_string()))
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn error_message(error: Option<&Value>) -> String {
    let Some(error) = error else {
        return "session error".to_string();
    };
    if let Some(text) = error.as_str() {
        return text.to_string();
    }
    error
        .get("data")
        .and_then(|data| str_field(data, "message"))
        .or_else(|| str_field(error, "message"))
        .or_else(|| str_field(error, "name"))
        .unwrap_or_else(|| "session error".to_string())
}

/// `provider/model` to the server's model reference
fn model_ref(model: &str) -> Option<Value> {
    let (provider, model_id) = model.split_once('/')?;
    if provider.is_empty() || model_id.is_empty() {
        return None;
    }
    Some(json!({"providerID": provider, "modelID": model_id}))
}

fn permission_reply(decision: PermissionDecision) -> &'static str {
    match decision {
        PermissionDecision::Approved => "once",
        PermissionDecision::ApprovedForSession => "always",
        PermissionDecision::Denied | PermissionDecision::Abort => "reject",
    }
}

fn permission_options() -> Vec<PermissionOption> {
    [
        ("once", "Allow once", "allow_once"),
        ("always", "Always allow", "allow_always"),
        ("reject", "Reject", "reject_once"),
    ]
    .into_iter()
    .map(|(id, name, kind)| PermissionOption {
        id: id.to_string(),
        name: name.to_string(),
        kind: kind.to_string(),
    })
    .collect()
}

struct Shared {
    name: String,
    transport: HttpSseTransport,
    sessions: Mutex<SessionTable>,
    permissions: PermissionCorrelator,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::PartUpdated {
                session_id,
                part,
                delta,
            } => {
                let mut sessions = self.sessions();
                let Some(local) = sessions.local_id(&session_id) else {
                    return;
                };
                sessions.with_prompt(&local, |prompt| {
                    for message in prompt.normalizer.message_part(&part, delta.as_deref()) {
                        prompt.push(message);
                    }
                });
            }
            ServerEvent::MessageUpdated {
                session_id,
                message_id,
                role,
            } => {
                if role != "user" {
                    return;
                }
                let mut sessions = self.sessions();
                if let Some(local) = sessions.local_id(&session_id) {
                    sessions.with_prompt(&local, |prompt| {
                        prompt.normalizer.note_user_message(&message_id)
                    });
                }
            }
            ServerEvent::SessionIdle { session_id } => {
                let mut sessions = self.sessions();
                if let Some(local) = sessions.local_id(&session_id) {
                    sessions.settle(&local, None, UnifiedMessage::turn_complete(StopReason::EndTurn));
                }
            }
            ServerEvent::SessionError {
                session_id: Some(session_id),
                message,
            } => {
                let mut sessions = self.sessions();
                if let Some(local) = sessions.local_id(&session_id) {
                    tracing::warn!(session_id = %local, %message, "Session error");
                    sessions.settle(&local, None, UnifiedMessage::error(message));
                }
            }
            ServerEvent::SessionError {
                session_id: None,
                message,
            } => {
                tracing::warn!(backend = %self.name, %message, "Server error without session");
            }
            ServerEvent::PermissionUpdated {
                session_id,
                permission,
            } => self.permission_prompt(session_id, permission),
            ServerEvent::PermissionReplied { permission_id } => {
                if self.permissions.forget(&permission_id) {
                    tracing::debug!(%permission_id, "Permission answered by another client");
                }
            }
            ServerEvent::Unrecognized(kind) => {
                tracing::trace!(%kind, "Ignoring server event");
            }
        }
    }

    fn permission_prompt(self: &Arc<Self>, remote_id: String, permission: Value) {
        let Some(permission_id) = str_field(&permission, "id") else {
            tracing::debug!("permission.updated without id");
            return;
        };
        let Some(session_id) = self.sessions().local_id(&remote_id) else {
            tracing::trace!(%remote_id, "Permission for a session we do not own");
            return;
        };

        let request = PermissionRequest {
            id: permission_id.clone(),
            session_id,
            tool_call_id: str_field(&permission, "callID"),
            title: str_field(&permission, "title")
                .unwrap_or_else(|| "Permission requested".to_string()),
            kind: str_field(&permission, "type"),
            raw_input: permission.get("metadata").cloned().unwrap_or(Value::Null),
            options: permission_options(),
            schema: None,
        };

        let decision = self.permissions.open(request);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let response = match decision.await {
                Ok(response) => response,
                Err(_) => {
                    tracing::debug!(%permission_id, "Permission settled elsewhere, not replying");
                    return;
                }
            };
            let reply = permission_reply(response.decision);
            if let Err(e) = transport
                .reply_permission(&remote_id, &permission_id, reply)
                .await
            {
                tracing::warn!(%permission_id, error = %e, "Failed to answer permission");
            }
        });
    }
}

/// Backend for agent servers exposing REST control calls plus `GET /event`
pub struct HttpSseAgent {
    config: HttpSseAgentConfig,
    model: Mutex<Option<String>>,
    shared: Arc<Shared>,
    events: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl HttpSseAgent {
    pub fn new(config: HttpSseAgentConfig) -> Result<Self> {
        let transport = HttpSseTransport::new(
            &config.base_url,
            config.directory.clone(),
            config.request_timeout_ms as f64,
        )?;
        if let Some(model) = &config.model {
            if model_ref(model).is_none() {
                return Err(AgentError::Config(format!(
                    "model must look like provider/model, got {model:?}"
                )));
            }
        }
        Ok(Self {
            model: Mutex::new(config.model.clone()),
            shared: Arc::new(Shared {
                name: config.name.clone(),
                transport,
                sessions: Mutex::new(SessionTable::new()),
                permissions: PermissionCorrelator::new(),
            }),
            events: tokio::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
            config,
        })
    }

    /// Factory function for the registry
    pub fn factory() -> BackendFactory {
        Box::new(|config| {
            let cfg: HttpSseAgentConfig = serde_json::from_value(config.clone())
                .map_err(|e| AgentError::Config(e.to_string()))?;
            let backend: SharedBackend = Arc::new(HttpSseAgent::new(cfg)?);
            Ok(backend)
        })
    }

    /// Open the event stream, or reopen it if it has ended
    async fn ensure_events(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AgentError::TransportClosed);
        }

        let mut slot = self.events.lock().await;
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return Ok(());
            }
            tracing::warn!(backend = %self.config.name, "Event stream ended, reopening");
        }

        let mut events = self.shared.transport.open_events().await?;
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            while let Some(payload) = events.next().await {
                shared.handle_event(ServerEvent::decode(&payload));
            }
            let failed = shared.sessions().fail_in_flight("event stream closed");
            tracing::debug!(backend = %shared.name, failed, "Event pump ended");
        }));
        Ok(())
    }
}

impl AgentBackend for HttpSseAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn initialize<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_events().await.map_err(|e| match e {
                AgentError::TransportClosed => e,
                other => AgentError::Initialization(format!("event stream unavailable: {other}")),
            })?;
            tracing::info!(backend = %self.config.name, base_url = %self.shared.transport.base_url(), "Connected to agent server");
            Ok(())
        })
    }

    fn new_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.ensure_events().await?;
            if config.cwd.is_some() {
                tracing::debug!("Per-session cwd is ignored; the server directory applies");
            }

            let created = self
                .shared
                .transport
                .create_session(json!({}))
                .await
                .map_err(|e| match e {
                    AgentError::Http(message) => AgentError::session_creation(message),
                    other => other,
                })?;
            let remote_id = created
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentError::session_creation("server returned no session id"))?;

            let model = config.model.or_else(|| self.model());
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
            self.ensure_events().await?;
            let start = self.shared.sessions().begin_prompt(session_id)?;

            let mut body = json!({"parts": [{"type": "text", "text": text}]});
            if let Some(model) = start.model.as_deref().and_then(model_ref) {
                body["model"] = model;
            }

            tracing::debug!(%session_id, turn_id = start.turn_id, prompt_len = text.len(), "Sending prompt");
            let shared = Arc::clone(&self.shared);
            let local = session_id.to_string();
            let remote = start.remote_id.clone();
            let turn_id = start.turn_id;
            let cancel = start.cancel.clone();

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    outcome = shared.transport.send_message(&remote, body) => outcome,
                    _ = cancel.cancelled() => {
                        tracing::debug!(session_id = %local, "Prompt request aborted");
                        return;
                    }
                };
                if let Err(e) = outcome {
                    tracing::warn!(session_id = %local, error = %e, "Prompt request failed");
                    shared
                        .sessions()
                        .settle(&local, Some(turn_id), UnifiedMessage::error(e.to_string()));
                }
            });

            Ok(start.receiver)
        })
    }

    fn cancel_prompt<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let remote_id = self.shared.sessions().remote_id(session_id)?;
            let settled = self.shared.sessions().settle(
                session_id,
                None,
                UnifiedMessage::turn_complete(StopReason::Cancelled),
            );
            let permissions = self.shared.permissions.cancel_session(session_id);
            if !settled {
                tracing::debug!(%session_id, "Cancel with no prompt in flight");
                return Ok(());
            }

            let transport = self.shared.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.abort(&remote_id).await {
                    tracing::debug!(%remote_id, error = %e, "Abort call failed");
                }
            });
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
            let in_flight = self.shared.sessions().in_flight_remote_ids();
            let sessions = self.shared.sessions().dispose_all();
            let permissions = self.shared.permissions.cancel_all();

            for remote_id in in_flight {
                let transport = self.shared.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.abort(&remote_id).await {
                        tracing::debug!(%remote_id, error = %e, "Abort during disconnect failed");
                    }
                });
            }
            if let Some(task) = self.events.lock().await.take() {
                task.abort();
            }
            tracing::info!(backend = %self.config.name, sessions, permissions, "Backend disconnected");
        })
    }

    fn model(&self) -> Option<String> {
        self.model.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if model_ref(model).is_none() {
                return Err(AgentError::Config(format!(
                    "model must look like provider/model, got {model:?}"
                )));
            }
            *self.model.lock().unwrap_or_else(|e| e.into_inner()) = Some(model.to_string());
            self.shared.sessions().set_model(Some(model.to_string()));
            Ok(())
        })
    }
}

impl Drop for HttpSseAgent {
    fn drop(&mut self) {
        if let Some(task) = self.events.get_mut().take() {
            task.abort();
        }
    }
}
