// ABOUTME: Per-prompt output channel carrying UnifiedMessages to the caller.
// ABOUTME: Finite and non-restartable: ends after turn_complete or error.

use crate::UnifiedMessage;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Buffer size for a prompt's message channel
pub const MESSAGE_BUFFER: usize = 2048;

/// Create a sender/receiver pair for one prompt
pub fn message_channel() -> (mpsc::Sender<UnifiedMessage>, MessageReceiver) {
    let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
    (tx, MessageReceiver::new(rx))
}

/// Receiver for streaming messages from a prompt.
///
/// This is `Send` so it can be passed across async task boundaries. It yields
/// `None` once the adapter has pushed the terminal message and dropped its
/// sender.
pub struct MessageReceiver {
    rx: mpsc::Receiver<UnifiedMessage>,
}

impl MessageReceiver {
    /// Create a new MessageReceiver wrapping the given channel
    pub fn new(rx: mpsc::Receiver<UnifiedMessage>) -> Self {
        Self { rx }
    }

    /// Receive the next message, or None if the stream is closed
    pub async fn recv(&mut self) -> Option<UnifiedMessage> {
        self.rx.recv().await
    }

    /// Try to receive a message without blocking
    pub fn try_recv(&mut self) -> Option<UnifiedMessage> {
        self.rx.try_recv().ok()
    }

    /// Drain the stream until the terminal message, returning everything seen
    pub async fn collect(mut self) -> Vec<UnifiedMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv().await {
            let terminal = message.is_terminal();
            messages.push(message);
            if terminal {
                break;
            }
        }
        messages
    }
}

impl Stream for MessageReceiver {
    type Item = UnifiedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
