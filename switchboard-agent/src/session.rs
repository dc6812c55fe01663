// ABOUTME: Per-adapter session table: local/remote ids, state machine, and the in-flight prompt slot.
// ABOUTME: A prompt settles exactly once; later completions for the same turn are discarded.

use crate::error::{AgentError, Result};
use crate::handle::{message_channel, MessageReceiver, MESSAGE_BUFFER};
use crate::message::{StopReason, UnifiedMessage};
use crate::normalize::UpdateNormalizer;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one session: `Created -> Prompting <-> Idle -> Disposed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Prompting,
    Idle,
    Disposed,
}

/// Output sink and bookkeeping for the prompt currently streaming on a session
pub struct InFlightPrompt {
    pub turn_id: u64,
    pub normalizer: UpdateNormalizer,
    pub cancel: CancellationToken,
    tx: mpsc::Sender<UnifiedMessage>,
}

impl InFlightPrompt {
    /// Push a non-terminal message to the caller
    pub fn push(&self, message: UnifiedMessage) {
        if let Err(e) = self.tx.try_send(message) {
            match e {
                mpsc::error::TrySendError::Full(dropped) => {
                    tracing::warn!(
                        dropped = ?dropped,
                        buffer = MESSAGE_BUFFER,
                        "Message channel buffer full, dropping message"
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!(turn_id = self.turn_id, "Message channel closed, receiver dropped");
                }
            }
        }
    }

    /// Hand the terminal message to the caller, consuming the sink.
    ///
    /// Never dropped for lack of room: with a full buffer the sender moves
    /// into a task that waits for the caller to drain.
    fn finish(self, terminal: UnifiedMessage) {
        let turn_id = self.turn_id;
        let tx = self.tx;
        match tx.try_send(terminal) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(turn_id, "Message channel closed, receiver dropped");
            }
            Err(mpsc::error::TrySendError::Full(terminal)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        tracing::debug!(turn_id, "Message channel full, queueing terminal message");
                        runtime.spawn(async move {
                            if tx.send(terminal).await.is_err() {
                                tracing::debug!(turn_id, "Receiver dropped before terminal message");
                            }
                        });
                    }
                    Err(_) => {
                        tracing::warn!(turn_id, "No runtime to deliver terminal message, dropping it");
                    }
                }
            }
        }
    }
}

/// Backend-local state for one conversation
pub struct Session {
    pub id: String,
    pub remote_id: String,
    pub model: Option<String>,
    pub state: SessionState,
    in_flight: Option<InFlightPrompt>,
}

impl Session {
    pub fn in_flight(&self) -> Option<&InFlightPrompt> {
        self.in_flight.as_ref()
    }
}

/// What `begin_prompt` hands back to the adapter
pub struct PromptStart {
    pub turn_id: u64,
    pub remote_id: String,
    pub model: Option<String>,
    pub cancel: CancellationToken,
    pub receiver: MessageReceiver,
}

/// Sessions owned by exactly one adapter instance
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<String, Session>,
    next_turn: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session the backend just created; returns the local id
    pub fn insert(&mut self, remote_id: impl Into<String>, model: Option<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let remote_id = remote_id.into();
        tracing::debug!(session_id = %id, remote_id = %remote_id, "Session created");
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                remote_id,
                model,
                state: SessionState::Created,
                in_flight: None,
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remote id of a live session
    pub fn remote_id(&self, id: &str) -> Result<String> {
        let session = self.live(id)?;
        Ok(session.remote_id.clone())
    }

    /// Local id for a backend-assigned id, skipping disposed sessions
    pub fn local_id(&self, remote_id: &str) -> Option<String> {
        self.sessions
            .values()
            .find(|s| s.remote_id == remote_id && s.state != SessionState::Disposed)
            .map(|s| s.id.clone())
    }

    pub fn set_model(&mut self, model: Option<String>) {
        for session in self.sessions.values_mut() {
            session.model = model.clone();
        }
    }

    fn live(&self, id: &str) -> Result<&Session> {
        match self.sessions.get(id) {
            None => Err(AgentError::UnknownSession(id.to_string())),
            Some(s) if s.state == SessionState::Disposed => {
                Err(AgentError::SessionInvalid(id.to_string()))
            }
            Some(s) => Ok(s),
        }
    }

    /// Move a session into `Prompting` with a fresh output channel.
    ///
    /// Fails with `PromptInFlight` if the previous prompt has not settled.
    pub fn begin_prompt(&mut self, id: &str) -> Result<PromptStart> {
        self.live(id)?;
        self.next_turn += 1;
        let turn_id = self.next_turn;

        let Some(session) = self.sessions.get_mut(id) else {
            return Err(AgentError::UnknownSession(id.to_string()));
        };
        if session.in_flight.is_some() {
            return Err(AgentError::PromptInFlight(id.to_string()));
        }

        let (tx, receiver) = message_channel();
        let cancel = CancellationToken::new();
        session.in_flight = Some(InFlightPrompt {
            turn_id,
            normalizer: UpdateNormalizer::new(),
            cancel: cancel.clone(),
            tx,
        });
        session.state = SessionState::Prompting;

        Ok(PromptStart {
            turn_id,
            remote_id: session.remote_id.clone(),
            model: session.model.clone(),
            cancel,
            receiver,
        })
    }

    /// Run `f` against the in-flight prompt of a session, if any
    pub fn with_prompt<R>(&mut self, id: &str, f: impl FnOnce(&mut InFlightPrompt) -> R) -> Option<R> {
        self.sessions
            .get_mut(id)
            .and_then(|s| s.in_flight.as_mut())
            .map(f)
    }

    /// Deliver the terminal message and return the session to `Idle`.
    ///
    /// With `turn_id` set, only that turn may be settled. Returns false if
    /// there was nothing to settle (already settled, or a newer turn).
    pub fn settle(&mut self, id: &str, turn_id: Option<u64>, terminal: UnifiedMessage) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        let matches = match (&session.in_flight, turn_id) {
            (Some(prompt), Some(turn)) => prompt.turn_id == turn,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            tracing::debug!(session_id = %id, ?turn_id, "Discarding late turn completion");
            return false;
        }

        if let Some(prompt) = session.in_flight.take() {
            tracing::debug!(session_id = %id, turn_id = prompt.turn_id, terminal = ?terminal, "Turn settled");
            prompt.cancel.cancel();
            prompt.finish(terminal);
        }
        if session.state != SessionState::Disposed {
            session.state = SessionState::Idle;
        }
        true
    }

    /// Remote ids of sessions with a prompt in flight
    pub fn in_flight_remote_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.in_flight.is_some())
            .map(|s| s.remote_id.clone())
            .collect()
    }

    /// Fail every in-flight prompt; sessions stay usable
    pub fn fail_in_flight(&mut self, reason: &str) -> usize {
        let ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.in_flight.is_some())
            .map(|s| s.id.clone())
            .collect();
        ids.iter()
            .filter(|id| self.settle(id, None, UnifiedMessage::error(reason)))
            .count()
    }

    /// Settle every in-flight prompt and mark all sessions disposed.
    ///
    /// Sessions stay in the table so later calls report `SessionInvalid`
    /// rather than `UnknownSession`.
    pub fn invalidate_all(&mut self, reason: &str) -> usize {
        let mut invalidated = 0;
        for session in self.sessions.values_mut() {
            if session.state == SessionState::Disposed {
                continue;
            }
            if let Some(prompt) = session.in_flight.take() {
                prompt.cancel.cancel();
                prompt.finish(UnifiedMessage::error(reason));
            }
            session.state = SessionState::Disposed;
            invalidated += 1;
        }
        invalidated
    }

    /// Teardown: settle in-flight prompts as cancelled and drop every session
    pub fn dispose_all(&mut self) -> usize {
        let count = self.sessions.len();
        for (_, mut session) in self.sessions.drain() {
            if let Some(prompt) = session.in_flight.take() {
                prompt.cancel.cancel();
                prompt.finish(UnifiedMessage::turn_complete(StopReason::Cancelled));
            }
        }
        count
    }
}
