// ABOUTME: Fallback argument probing for agents whose invocation differs across installed versions.
// ABOUTME: Tries candidate argument sets in order, fully closing each failure before the next.

use crate::error::{AgentError, Result};
use async_trait::async_trait;

/// Launch and handshake steps for one candidate argument set
#[async_trait]
pub trait LaunchProbe: Send + Sync {
    type Connection: Send;

    /// Start the transport with these arguments
    async fn launch(&self, args: &[String]) -> Result<Self::Connection>;

    /// Run the initialization handshake on a launched transport
    async fn handshake(&self, connection: &Self::Connection) -> Result<()>;

    /// Close a transport, terminating its process
    async fn close(&self, connection: Self::Connection);
}

/// Return the first candidate whose launch and handshake both succeed.
///
/// If every candidate fails, the last candidate's error is returned.
pub async fn probe<P: LaunchProbe>(prober: &P, candidates: &[Vec<String>]) -> Result<P::Connection> {
    let mut last_error = None;

    for (index, args) in candidates.iter().enumerate() {
        let connection = match prober.launch(args).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::debug!(candidate = index, ?args, error = %e, "Launch candidate failed");
                last_error = Some(e);
                continue;
            }
        };

        match prober.handshake(&connection).await {
            Ok(()) => {
                if index > 0 {
                    tracing::info!(candidate = index, ?args, "Fallback arguments accepted");
                }
                return Ok(connection);
            }
            Err(e) => {
                tracing::debug!(candidate = index, ?args, error = %e, "Handshake failed, closing candidate");
                prober.close(connection).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| AgentError::Initialization("no launch candidates configured".to_string())))
}
