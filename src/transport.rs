//! Child process supervision and JSON-RPC message plumbing.
//!
//! [`ServerTransport`] owns the fortls child and its framed stdio channel:
//! a writer task drains an mpsc queue into the child's stdin, and a reader
//! task classifies each inbound frame as a correlated response, a
//! server-to-client request, or a notification. Notifications are handed to
//! the [`NotificationRouter`]; there is exactly one delivery path per
//! session and handlers run inline on it.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{Notification, Request};
use crate::types::Invocation;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

type Handler = Arc<dyn Fn(Option<serde_json::Value>) + Send + Sync>;

type Pending = Arc<tokio::sync::Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

/// Dispatches inbound server notifications to handlers by method name.
///
/// Unregistered methods are silently discarded: most server notifications
/// (diagnostics, progress) are irrelevant to the session and must not
/// surface as errors. Handlers run synchronously on the reader task and
/// must not block.
#[derive(Default)]
pub struct NotificationRouter {
    handlers: Mutex<HashMap<String, Handler>>,
}

impl NotificationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Handler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for `method`. Registering twice for the same
    /// method replaces the earlier handler.
    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<serde_json::Value>) + Send + Sync + 'static,
    {
        self.lock().insert(method.into(), Arc::new(handler));
    }

    pub fn dispatch(&self, method: &str, params: Option<serde_json::Value>) {
        // The lock is released before the handler runs, so a handler may
        // register or replace handlers on the same router.
        let handler = self.lock().get(method).cloned();
        if let Some(handler) = handler {
            handler(params);
        } else {
            trace!("discarding unrouted notification: {method}");
        }
    }
}

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn classify(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id), None, true) => Some(IncomingFrame::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Handle to a running fortls process and its message channel.
///
/// Exactly one per session; the invocation and channel are never shared.
pub struct ServerTransport {
    child: Option<Child>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: u64,
    pending: Pending,
    alive: Arc<AtomicBool>,
    #[allow(dead_code)]
    reader_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: tokio::task::JoinHandle<()>,
}

impl ServerTransport {
    /// Launch the resolved invocation with the project root as working
    /// directory and attach the message channel to its stdio.
    pub fn spawn(
        invocation: &Invocation,
        project_root: &Path,
        router: Arc<NotificationRouter>,
    ) -> Result<Self> {
        let mut cmd = Command::new(invocation.command());
        cmd.args(invocation.args())
            .current_dir(project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", invocation.command().display()))?;

        let stdout = child.stdout.take().context("no stdout from fortls")?;
        let stdin = child.stdin.take().context("no stdin from fortls")?;

        let mut transport = Self::from_streams(stdout, stdin, router);
        transport.child = Some(child);
        Ok(transport)
    }

    /// Build a transport over arbitrary streams.
    ///
    /// This is the seam test harnesses use to stand in for a real server
    /// (e.g. both ends of `tokio::io::duplex`). No child process is owned.
    pub fn from_streams<R, W>(reader: R, writer: W, router: Arc<NotificationRouter>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut frames = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = frames.write_frame(&frame).await {
                            warn!("write to fortls failed: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
            // Close the write stream so the server observes EOF; a child's
            // stdin pipe closes on drop, but a generic stream seam (e.g. a
            // split duplex half) stays open until shut down explicitly.
            let _ = frames.shutdown().await;
        });

        let reader_pending = pending.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_alive = alive.clone();
        let reader_handle = tokio::spawn(async move {
            let mut frames = FrameReader::new(reader);
            loop {
                match frames.read_frame().await {
                    Ok(Some(frame)) => {
                        dispatch_frame(&frame, &reader_pending, &router, &reader_writer_tx).await;
                    }
                    Ok(None) => {
                        info!("fortls closed its output stream");
                        break;
                    }
                    Err(e) => {
                        warn!("error reading from fortls: {e}");
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::Release);
            // Dropping the senders fails any request still waiting for a
            // response instead of leaving it to hit the response timeout.
            reader_pending.lock().await.clear();
        });

        Self {
            child: None,
            writer_tx,
            next_id: 1,
            pending,
            alive,
            reader_handle,
            writer_handle,
        }
    }

    /// Whether the message channel is still open. Cleared when the reader
    /// hits EOF or an error, i.e. when the process is gone.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send a request and await its single correlated response body.
    pub async fn request(
        &mut self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        if !self.is_alive() {
            bail!("fortls process has exited");
        }

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            bail!("writer channel closed");
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                bail!("fortls closed before responding to {method}");
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("{method} request timed out");
            }
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow::anyhow!("writer channel closed"))?;
        Ok(())
    }

    /// Graceful teardown: LSP shutdown/exit, then wait, then kill.
    /// Consumes self; safe on abnormal teardown paths too.
    pub async fn shutdown(mut self) {
        if self.is_alive()
            && let Ok(response) = self.request("shutdown", None).await
            && response.get("error").is_none()
        {
            let _ = self.notify("exit", None).await;
        }

        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if let Some(mut child) = self.child.take()
            && tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await.is_err()
        {
            debug!("fortls didn't exit in time, killing");
            let _ = child.kill().await;
        }
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        // Abnormal teardown (e.g. a failed handshake drops the transport
        // without `shutdown()`): stop the writer task so the channel closes
        // and the server sees EOF, mirroring `kill_on_drop` on the child.
        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);
    }
}

async fn dispatch_frame(
    frame: &serde_json::Value,
    pending: &tokio::sync::Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    router: &NotificationRouter,
    writer_tx: &mpsc::Sender<WriterCommand>,
) {
    let Some(incoming) = classify(frame) else {
        trace!("ignoring malformed JSON-RPC frame from fortls");
        return;
    };

    match incoming {
        IncomingFrame::Response { id, body } => {
            let sender = pending.lock().await.remove(&id);
            if let Some(tx) = sender {
                let _ = tx.send(body);
            }
        }
        IncomingFrame::ServerRequest { id, method } => {
            // Servers may send client/registerCapability or
            // workspace/configuration; reply or the server may block.
            debug!("fortls sent request {method}, replying method-not-found");
            let response = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32601,
                    "message": format!("Method not found: {method}")
                }
            });
            let _ = writer_tx.send(WriterCommand::Send(response)).await;
        }
        IncomingFrame::Notification { method, params } => {
            router.dispatch(&method, params);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn harness() -> (
        Pending,
        Arc<NotificationRouter>,
        mpsc::Sender<WriterCommand>,
        mpsc::Receiver<WriterCommand>,
    ) {
        let pending: Pending = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let router = Arc::new(NotificationRouter::new());
        let (writer_tx, writer_rx) = mpsc::channel(8);
        (pending, router, writer_tx, writer_rx)
    }

    #[tokio::test]
    async fn response_routes_to_pending_request() {
        let (pending, router, writer_tx, _writer_rx) = harness();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(1, tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "capabilities": { "documentSymbolProvider": true } }
        });
        dispatch_frame(&frame, &pending, &router, &writer_tx).await;

        let response = rx.await.unwrap();
        assert_eq!(response["result"]["capabilities"]["documentSymbolProvider"], true);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn error_response_still_routes_to_pending() {
        let (pending, router, writer_tx, _writer_rx) = harness();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(2, tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": { "code": -32600, "message": "invalid request" }
        });
        dispatch_frame(&frame, &pending, &router, &writer_tx).await;

        assert!(rx.await.unwrap()["error"].is_object());
    }

    #[tokio::test]
    async fn response_for_unknown_id_is_dropped() {
        let (pending, router, writer_tx, _writer_rx) = harness();
        let frame = serde_json::json!({ "jsonrpc": "2.0", "id": 99, "result": {} });
        dispatch_frame(&frame, &pending, &router, &writer_tx).await;
    }

    #[tokio::test]
    async fn server_request_gets_method_not_found_reply() {
        let (pending, router, writer_tx, mut writer_rx) = harness();
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "client/registerCapability",
            "params": {}
        });
        dispatch_frame(&frame, &pending, &router, &writer_tx).await;

        match writer_rx.try_recv().unwrap() {
            WriterCommand::Send(reply) => {
                assert_eq!(reply["id"], 7);
                assert_eq!(reply["error"]["code"], -32601);
            }
            WriterCommand::Shutdown => panic!("expected Send"),
        }
    }

    #[tokio::test]
    async fn notification_reaches_registered_handler() {
        let (pending, router, writer_tx, _writer_rx) = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.on("window/logMessage", move |params| {
            sink.lock().unwrap().push(params);
        });

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "window/logMessage",
            "params": { "type": 3, "message": "parsing complete" }
        });
        dispatch_frame(&frame, &pending, &router, &writer_tx).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap()["message"], "parsing complete");
    }

    #[tokio::test]
    async fn unregistered_notification_is_silently_discarded() {
        let (pending, router, writer_tx, mut writer_rx) = harness();
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "telemetry/event",
            "params": { "data": 1 }
        });
        dispatch_frame(&frame, &pending, &router, &writer_tx).await;

        // No reply, no pending mutation, no panic.
        assert!(writer_rx.try_recv().is_err());
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_is_ignored() {
        let (pending, router, writer_tx, mut writer_rx) = harness();
        let frame = serde_json::json!({ "jsonrpc": "2.0" });
        dispatch_frame(&frame, &pending, &router, &writer_tx).await;
        assert!(writer_rx.try_recv().is_err());
    }

    #[test]
    fn router_last_registration_wins() {
        let router = NotificationRouter::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        router.on("$/progress", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = second.clone();
        router.on("$/progress", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        router.dispatch("$/progress", None);
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn handler_may_register_on_the_same_router() {
        let router = Arc::new(NotificationRouter::new());
        let fired = Arc::new(AtomicUsize::new(0));

        // A handler that installs another handler must not deadlock on
        // the router's own lock.
        let registrar = router.clone();
        let counter = fired.clone();
        router.on("window/logMessage", move |_| {
            let counter = counter.clone();
            registrar.on("$/progress", move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        });

        router.dispatch("window/logMessage", None);
        router.dispatch("$/progress", None);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn request_over_streams_roundtrips() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        // Fake server: answer the first request with an empty result.
        tokio::spawn(async move {
            let mut reader = FrameReader::new(server_read);
            let mut writer = FrameWriter::new(server_write);
            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(frame["method"], "initialize");
            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "result": { "capabilities": {} }
            });
            writer.write_frame(&reply).await.unwrap();
        });

        let router = Arc::new(NotificationRouter::new());
        let mut transport = ServerTransport::from_streams(client_read, client_write, router);
        let response = transport
            .request("initialize", Some(serde_json::json!({})))
            .await
            .unwrap();
        assert!(response["result"]["capabilities"].is_object());
    }

    #[tokio::test]
    async fn request_after_server_eof_fails_without_hanging() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);

        let router = Arc::new(NotificationRouter::new());
        let mut transport = ServerTransport::from_streams(client_read, client_write, router);

        // Server hangs up immediately.
        drop(server_io);
        tokio::task::yield_now().await;

        let mut attempts = 0;
        while transport.is_alive() && attempts < 100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            attempts += 1;
        }
        assert!(!transport.is_alive());
        assert!(transport.request("shutdown", None).await.is_err());
    }
}
