// ABOUTME: JSON-RPC over a child process's stdin/stdout with id correlation.
// ABOUTME: stderr is a diagnostic side channel; the child is killed and reaped on every exit path.

use crate::error::{AgentError, Result};
use crate::timeout::with_timeout;
use crate::transport::frame::{Frame, RequestId, RpcError};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Lines of child stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// How long `close` waits for the stderr forwarder to finish
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// How long `close_writer` waits for replies to peer requests to be written
const REPLY_DRAIN: Duration = Duration::from_millis(500);

/// Receives traffic initiated by the peer.
///
/// Installed before the first frame is written so nothing the peer sends
/// during the handshake is lost.
pub trait InboundHandler: Send + Sync + 'static {
    /// A notification arrived. Called on the reader task, in wire order.
    fn on_notification(&self, method: &str, params: Value);

    /// A request arrived; the resolved value is written back under the same id.
    fn on_request(&self, method: &str, params: Value)
        -> BoxFuture<'static, std::result::Result<Value, RpcError>>;

    /// The inbound stream ended (EOF or read error)
    fn on_closed(&self) {}
}

type PendingRequests = HashMap<RequestId, oneshot::Sender<Result<Value>>>;
type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;
type FrameReader = Box<dyn AsyncRead + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<Option<FrameWriter>>>;

/// Removes a pending entry if the waiting future goes away before a response
struct PendingGuard {
    pending: Arc<Mutex<PendingRequests>>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Duplex JSON-RPC connection over any byte streams.
///
/// Owns the pending-request table: every response is delivered to the
/// request with the matching id exactly once; responses for unknown ids are
/// dropped.
pub struct FramedConnection {
    writer: SharedWriter,
    pending: Arc<Mutex<PendingRequests>>,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    replies: TaskTracker,
}

impl FramedConnection {
    /// Wire up a connection and start decoding inbound frames
    pub fn new(writer: FrameWriter, reader: FrameReader, handler: Arc<dyn InboundHandler>) -> Self {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(writer)));
        let pending: Arc<Mutex<PendingRequests>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let replies = TaskTracker::new();

        let reader_task = tokio::spawn(read_frames(
            reader,
            handler,
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&closed),
            replies.clone(),
        ));

        Self {
            writer,
            pending,
            next_id: AtomicI64::new(1),
            closed,
            reader_task: Mutex::new(Some(reader_task)),
            replies,
        }
    }

    /// Whether the inbound side has ended
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Send a request and wait for its response
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, 0.0).await
    }

    /// Send a request, giving up after `timeout_ms` (disabled when non-positive or non-finite)
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout_ms: f64,
    ) -> Result<Value> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if self.is_closed() {
                return Err(AgentError::TransportClosed);
            }
            pending.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
        };

        tracing::trace!(%id, method, "Sending request");
        write_frame(
            &self.writer,
            &Frame::Request {
                id,
                method: method.to_string(),
                params,
            },
        )
        .await?;

        with_timeout(
            async { rx.await.unwrap_or(Err(AgentError::TransportClosed)) },
            timeout_ms,
        )
        .await
    }

    /// Send a notification; no id, nothing to wait for
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        tracing::trace!(method, "Sending notification");
        write_frame(
            &self.writer,
            &Frame::Notification {
                method: method.to_string(),
                params,
            },
        )
        .await
    }

    /// Close the write side; the peer sees EOF on its input.
    ///
    /// Replies to peer requests that are already resolving get a short window
    /// to reach the wire first.
    pub async fn close_writer(&self) {
        self.replies.close();
        if tokio::time::timeout(REPLY_DRAIN, self.replies.wait()).await.is_err() {
            tracing::debug!(
                unanswered = self.replies.len(),
                "Closing writer with peer requests still unanswered"
            );
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "Error shutting down frame writer");
            }
        }
    }

    /// Stop decoding and fail every outstanding request
    pub fn shutdown(&self) {
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        fail_pending(&self.pending, &self.closed);
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn write_frame(writer: &SharedWriter, frame: &Frame) -> Result<()> {
    let mut line = frame.encode();
    line.push('\n');
    let mut guard = writer.lock().await;
    let writer = guard.as_mut().ok_or(AgentError::TransportClosed)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn fail_pending(pending: &Mutex<PendingRequests>, closed: &AtomicBool) {
    closed.store(true, Ordering::SeqCst);
    let drained: Vec<_> = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .collect();
    for (_, sender) in drained {
        let _ = sender.send(Err(AgentError::TransportClosed));
    }
}

async fn read_frames(
    reader: FrameReader,
    handler: Arc<dyn InboundHandler>,
    writer: SharedWriter,
    pending: Arc<Mutex<PendingRequests>>,
    closed: Arc<AtomicBool>,
    replies: TaskTracker,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Frame reader failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let Some(frame) = Frame::decode(&line) else {
            continue;
        };

        match frame {
            Frame::Response { id, outcome } => {
                let sender = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                match sender {
                    Some(sender) => {
                        let outcome = outcome.map_err(|e| AgentError::Rpc {
                            code: e.code,
                            message: e.message,
                        });
                        let _ = sender.send(outcome);
                    }
                    None => tracing::debug!(%id, "Dropping response without pending request"),
                }
            }
            Frame::Notification { method, params } => handler.on_notification(&method, params),
            Frame::Request { id, method, params } => {
                tracing::debug!(%id, method = %method, "Peer-initiated request");
                let reply = handler.on_request(&method, params);
                let writer = Arc::clone(&writer);
                replies.spawn(async move {
                    let outcome = reply.await;
                    if let Err(e) = write_frame(&writer, &Frame::Response { id, outcome }).await {
                        tracing::debug!(error = %e, "Failed to answer peer request");
                    }
                });
            }
            Frame::Unrecognized(value) => tracing::trace!(%value, "Ignoring unrecognized frame"),
        }
    }

    fail_pending(&pending, &closed);
    handler.on_closed();
    tracing::debug!("Frame reader ended");
}

/// How to launch a framed-stdio agent
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Owns a child process: kills and reaps it on close, kills it on drop.
struct ChildGuard {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Mutex::new(Some(child)),
            pid,
        }
    }

    fn is_running(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Give the child `grace` to exit on its own, then kill it
    async fn terminate(&self, grace: Duration) {
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut child) = child else {
            return;
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(pid = ?self.pid, %status, "Agent process exited"),
            Ok(Err(e)) => tracing::debug!(pid = ?self.pid, error = %e, "Failed waiting on agent process"),
            Err(_) => {
                tracing::debug!(pid = ?self.pid, "Agent process did not exit in time, killing");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill agent process");
                }
                let _ = child.wait().await;
            }
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Failed to kill agent process during Drop");
            }
        }
    }
}

/// Framed JSON-RPC transport over a spawned agent process
pub struct FramedStdioTransport {
    connection: FramedConnection,
    child: ChildGuard,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    close_grace: Duration,
    closing: AtomicBool,
}

impl FramedStdioTransport {
    /// Spawn the agent and start decoding its stdout.
    ///
    /// `handler` is installed before this returns, ahead of any traffic.
    pub fn start(
        spec: &LaunchSpec,
        handler: Arc<dyn InboundHandler>,
        close_grace: Duration,
    ) -> Result<Self> {
        if spec.command.is_empty() || spec.command.contains('\0') {
            return Err(AgentError::Config("invalid agent command".to_string()));
        }

        tracing::info!(command = %spec.command, args = ?spec.args, "Spawning agent process");

        let mut command = ProcessCommand::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            AgentError::Initialization(format!("failed to spawn {}: {e}", spec.command))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(AgentError::Initialization(
                "agent process is missing a standard stream".to_string(),
            ));
        };
        let child = ChildGuard::new(child);

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = tokio::spawn(forward_stderr(stderr, Arc::clone(&stderr_tail), child.pid));

        let connection = FramedConnection::new(Box::new(stdin), Box::new(stdout), handler);

        Ok(Self {
            connection,
            child,
            stderr_tail,
            stderr_task: Mutex::new(Some(stderr_task)),
            close_grace,
            closing: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.pid
    }

    /// The process is running and its stdout is still open
    pub fn is_alive(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.connection.is_closed() && self.child.is_running()
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.connection.request(method, params).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout_ms: f64,
    ) -> Result<Value> {
        self.connection
            .request_with_timeout(method, params, timeout_ms)
            .await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.connection.notify(method, params).await
    }

    /// Most recent stderr lines, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Close stdin, wait briefly for the child to exit, then kill it.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(pid = ?self.child.pid, "Closing agent transport");
        self.connection.close_writer().await;
        self.child.terminate(self.close_grace).await;
        self.connection.shutdown();

        // stderr reaches EOF once the child is gone; drain it so the tail is complete
        let stderr_task = self
            .stderr_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = stderr_task {
            if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
                tracing::debug!(pid = ?self.child.pid, "stderr still open after close");
            }
        }
    }
}

async fn forward_stderr(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        tracing::debug!(target: "switchboard_agent::stderr", pid = ?pid, "{}", line);
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
