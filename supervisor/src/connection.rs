//! Persistent JSON-RPC 2.0 session over a child's stdio
//!
//! A background reader owns the child's stdout. It classifies every line and
//! routes responses to the pending request with the same id, so concurrent
//! calls on one connection are matched by id and never by arrival order.
//! Notifications and server-initiated requests go to a callback; garbage
//! lines are logged and dropped.
//!
//! A pending [`StdioRpcConnection::call`] wakes on its response, its
//! deadline, or a backoff tick that re-checks process liveness. A dead
//! process therefore fails the call within one tick rather than at the
//! request timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, SupervisorError};
use crate::process::LivenessProbe;
use crate::protocol::{
    encode_line, CallToolParams, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, Method, ServerInfo, METHOD_NOT_FOUND,
};

type Outcome = std::result::Result<Value, JsonRpcError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Outcome>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Unsolicited traffic from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Server-initiated request; already answered with "method not found"
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Response whose id matches nothing pending (late or unknown)
    Unmatched { id: Value, outcome: Outcome },
}

/// Callback for [`ServerMessage`]s; runs on the reader task, keep it short
pub type MessageHandler = Arc<dyn Fn(ServerMessage) + Send + Sync>;

/// Timeouts and polling bounds
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// First liveness re-check after sending a request
    pub poll_min: Duration,
    /// Backoff ceiling between liveness re-checks
    pub poll_max: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            poll_min: Duration::from_millis(10),
            poll_max: Duration::from_millis(250),
        }
    }
}

/// Builder for [`StdioRpcConnection`]
pub struct ConnectionBuilder {
    name: String,
    settings: ConnectionSettings,
    liveness: Option<LivenessProbe>,
    handler: Option<MessageHandler>,
}

impl ConnectionBuilder {
    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Probe consulted while calls are pending
    pub fn liveness(mut self, probe: LivenessProbe) -> Self {
        self.liveness = Some(probe);
        self
    }

    pub fn on_message(mut self, handler: MessageHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Wire the connection to a reader (child stdout) and writer (child stdin)
    ///
    /// Must be called inside a tokio runtime; the reader task starts here.
    pub fn connect<R, W>(self, reader: R, writer: W) -> StdioRpcConnection
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(boxed));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let name = self.name.clone();
        let handler: MessageHandler = match self.handler {
            Some(handler) => handler,
            None => {
                let name = name.clone();
                Arc::new(move |msg: ServerMessage| {
                    tracing::debug!(process = %name, ?msg, "unsolicited server message");
                })
            }
        };

        let reader_task = tokio::spawn(read_loop(
            name,
            reader,
            pending.clone(),
            writer.clone(),
            closed.clone(),
            handler,
        ));

        StdioRpcConnection {
            name: self.name,
            settings: self.settings,
            liveness: self.liveness,
            writer,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            capabilities: RwLock::new(None),
            server_info: RwLock::new(None),
            reader_task,
        }
    }
}

/// One JSON-RPC session with one process
pub struct StdioRpcConnection {
    name: String,
    settings: ConnectionSettings,
    liveness: Option<LivenessProbe>,
    writer: SharedWriter,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    capabilities: RwLock<Option<Value>>,
    server_info: RwLock<Option<ServerInfo>>,
    reader_task: JoinHandle<()>,
}

impl StdioRpcConnection {
    pub fn builder(name: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder {
            name: name.into(),
            settings: ConnectionSettings::default(),
            liveness: None,
            handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities advertised during the handshake
    pub fn capabilities(&self) -> Option<Value> {
        self.capabilities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of calls waiting for a response
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// False once stdout hit EOF or the process is known dead
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.liveness.as_ref().map_or(true, |alive| alive())
    }

    /// Perform the `initialize` / `notifications/initialized` exchange
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let handshake_failed = |message: String| SupervisorError::HandshakeFailed {
            name: self.name.clone(),
            message,
        };

        let params = serde_json::to_value(InitializeParams::for_this_client())?;
        let value = self
            .call_with_timeout(Method::Initialize, Some(params), self.settings.handshake_timeout)
            .await
            .map_err(|e| handshake_failed(e.to_string()))?;

        if !value.is_object() {
            return Err(handshake_failed(format!(
                "initialize result is not an object: {}",
                value
            )));
        }
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| handshake_failed(format!("invalid initialize result: {}", e)))?;

        *self
            .capabilities
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(result.capabilities.clone());
        *self
            .server_info
            .write()
            .unwrap_or_else(|p| p.into_inner()) = result.server_info.clone();

        self.notify(Method::Initialized, None)
            .await
            .map_err(|e| handshake_failed(e.to_string()))?;

        tracing::info!(
            process = %self.name,
            server = ?result.server_info.as_ref().map(|s| &s.name),
            "handshake complete"
        );
        Ok(result)
    }

    /// Send a request and wait for its response using the default timeout
    pub async fn call(&self, method: Method, params: Option<Value>) -> Result<Value> {
        self.call_with_timeout(method, params, self.settings.request_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: Method,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(SupervisorError::ProcessDied(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        let deadline = Instant::now() + timeout;
        let request = JsonRpcRequest::new(id, method, params);
        tracing::debug!(process = %self.name, id, %method, "sending request");

        match tokio::time::timeout_at(deadline, self.write_message(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.forget(id);
                return Err(e);
            }
            Err(_) => {
                self.forget(id);
                return Err(self.timeout_error(method, timeout));
            }
        }

        let mut delay = self.settings.poll_min;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.forget(id);
                return Err(self.timeout_error(method, timeout));
            }

            tokio::select! {
                biased;
                outcome = &mut rx => return self.settle(outcome),
                _ = tokio::time::sleep(delay.min(deadline - now)) => {
                    if !self.is_alive() {
                        // The response may have landed just before the exit
                        if let Ok(outcome) = rx.try_recv() {
                            return self.settle(Ok(outcome));
                        }
                        self.forget(id);
                        return Err(SupervisorError::ProcessDied(self.name.clone()));
                    }
                    delay = (delay * 2).min(self.settings.poll_max);
                }
            }
        }
    }

    /// Fire-and-forget notification
    pub async fn notify(&self, method: Method, params: Option<Value>) -> Result<()> {
        debug_assert!(!method.expects_response(), "{} expects a response", method);
        if !self.is_alive() {
            return Err(SupervisorError::ProcessDied(self.name.clone()));
        }
        self.write_message(&JsonRpcRequest::notification(method, params))
            .await
    }

    /// `tools/call`
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments,
        })?;
        self.call(Method::ToolsCall, Some(params)).await
    }

    /// `tools/list`
    pub async fn list_tools(&self) -> Result<Value> {
        self.call(Method::ToolsList, None).await
    }

    /// `ping` with a caller-chosen timeout
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.call_with_timeout(Method::Ping, None, timeout).await?;
        Ok(())
    }

    /// Stop reading and fail every pending call
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader_task.abort();
        self.lock_pending().clear();
    }

    fn settle(
        &self,
        outcome: std::result::Result<Outcome, oneshot::error::RecvError>,
    ) -> Result<Value> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(SupervisorError::Rpc {
                code: error.code,
                message: error.message,
            }),
            // Sender dropped: the reader hit EOF or the connection was closed
            Err(_) => Err(SupervisorError::ProcessDied(self.name.clone())),
        }
    }

    fn timeout_error(&self, method: Method, timeout: Duration) -> SupervisorError {
        SupervisorError::RequestTimeout {
            name: self.name.clone(),
            method: method.to_string(),
            timeout,
        }
    }

    fn forget(&self, id: u64) {
        self.lock_pending().remove(&id);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Outcome>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<()> {
        match write_line(&self.writer, message).await {
            Ok(()) => Ok(()),
            Err(SupervisorError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(SupervisorError::ProcessDied(self.name.clone()))
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for StdioRpcConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn write_line<T: Serialize>(writer: &SharedWriter, message: &T) -> Result<()> {
    let line = encode_line(message)?;
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    name: String,
    reader: R,
    pending: PendingMap,
    writer: SharedWriter,
    closed: Arc<AtomicBool>,
    handler: MessageHandler,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() {
                    dispatch(&name, line, &pending, &writer, &handler).await;
                }
            }
            Err(e) => {
                tracing::debug!(process = %name, "stdout read failed: {}", e);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let orphaned = {
        let mut pending = pending.lock().unwrap_or_else(|p| p.into_inner());
        let count = pending.len();
        pending.clear();
        count
    };
    if orphaned > 0 {
        tracing::warn!(process = %name, orphaned, "stdout closed with requests pending");
    } else {
        tracing::debug!(process = %name, "stdout closed");
    }
}

async fn dispatch(
    name: &str,
    line: &str,
    pending: &PendingMap,
    writer: &SharedWriter,
    handler: &MessageHandler,
) {
    let message = match IncomingMessage::parse(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(process = %name, "discarding unparseable line: {}", e);
            tracing::debug!(process = %name, line, "discarded line");
            return;
        }
    };

    match message {
        IncomingMessage::Response { id, outcome } => {
            let waiter = id.as_u64().and_then(|key| {
                pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&key)
            });
            match waiter {
                Some(tx) => {
                    if tx.send(outcome).is_err() {
                        tracing::debug!(process = %name, %id, "caller gave up before response");
                    }
                }
                None => {
                    tracing::debug!(process = %name, %id, "response matches no pending request");
                    handler(ServerMessage::Unmatched { id, outcome });
                }
            }
        }
        IncomingMessage::Notification { method, params } => {
            handler(ServerMessage::Notification { method, params });
        }
        IncomingMessage::Request { id, method, params } => {
            tracing::debug!(process = %name, %method, "server request not supported");
            let reply = JsonRpcResponse::failure(
                id.clone(),
                JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", method)),
            );
            handler(ServerMessage::Request { id, method, params });
            if let Err(e) = write_line(writer, &reply).await {
                tracing::debug!(process = %name, "failed to answer server request: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// Scripted peer on the other end of a duplex pipe
    struct Peer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.send_raw(&format!("{}\n", value)).await;
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            request_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            poll_min: Duration::from_millis(5),
            poll_max: Duration::from_millis(50),
        }
    }

    fn pair(builder: ConnectionBuilder) -> (Arc<StdioRpcConnection>, Peer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let conn = builder.settings(settings()).connect(read, write);
        let (peer_read, peer_write) = tokio::io::split(theirs);
        let peer = Peer {
            lines: BufReader::new(peer_read).lines(),
            writer: peer_write,
        };
        (Arc::new(conn), peer)
    }

    fn collecting_handler() -> (MessageHandler, Arc<Mutex<Vec<ServerMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler =
            Arc::new(move |msg: ServerMessage| sink.lock().unwrap().push(msg));
        (handler, seen)
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_not_order() {
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t"));

        let c1 = conn.clone();
        let first = tokio::spawn(async move { c1.call_tool("echo", json!({"n": 1})).await });
        let req_a = peer.recv().await;
        let c2 = conn.clone();
        let second = tokio::spawn(async move { c2.call_tool("echo", json!({"n": 2})).await });
        let req_b = peer.recv().await;

        // Answer the later request first
        for req in [&req_b, &req_a] {
            peer.send(json!({"jsonrpc": "2.0", "id": req["id"], "result": req["params"]["arguments"]}))
                .await;
        }

        assert_eq!(first.await.unwrap().unwrap(), json!({"n": 1}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"n": 2}));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notification_before_response() {
        let (handler, seen) = collecting_handler();
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t").on_message(handler));

        let c = conn.clone();
        let call = tokio::spawn(async move { c.call(Method::ToolsList, None).await });
        let req = peer.recv().await;
        peer.send(json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"p": 50}}))
            .await;
        peer.send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"tools": []}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"tools": []}));
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[ServerMessage::Notification {
                method: "notifications/progress".into(),
                params: Some(json!({"p": 50})),
            }]
        );
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t"));
        let c = conn.clone();
        let call = tokio::spawn(async move { c.call(Method::Ping, None).await });
        let req = peer.recv().await;
        peer.send_raw("this is not json\n\n[1,2,3]\n").await;
        peer.send_raw(&format!("{{\"jsonrpc\":\"2.0\",\"id\":{},\"result\":{{}}}}\n", req["id"]))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_error_response_maps_to_rpc_error() {
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t"));
        let c = conn.clone();
        let call = tokio::spawn(async move { c.call_tool("missing", json!({})).await });
        let req = peer.recv().await;
        peer.send(json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32602, "message": "unknown tool"}}))
            .await;
        match call.await.unwrap() {
            Err(SupervisorError::Rpc { code, message }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "unknown tool");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_fails_pending_call_fast() {
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t"));
        let c = conn.clone();
        let call = tokio::spawn(async move { c.call(Method::Ping, None).await });
        peer.recv().await;
        drop(peer);

        let started = std::time::Instant::now();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::ProcessDied(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_liveness_flip_fails_pending_call_fast() {
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let probe: LivenessProbe = Arc::new(move || flag.load(Ordering::SeqCst));
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t").liveness(probe));

        let c = conn.clone();
        let call = tokio::spawn(async move { c.call(Method::Ping, None).await });
        peer.recv().await;
        let started = std::time::Instant::now();
        alive.store(false, Ordering::SeqCst);

        let result = call.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::ProcessDied(_))));
        // One poll interval, not the five-second request timeout
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_clears_pending() {
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t"));
        let c = conn.clone();
        let call = tokio::spawn(async move {
            c.call_with_timeout(Method::Ping, None, Duration::from_millis(100))
                .await
        });
        peer.recv().await;
        match call.await.unwrap() {
            Err(SupervisorError::RequestTimeout { method, .. }) => assert_eq!(method, "ping"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.pending_count(), 0);

        // A late answer is routed to the handler, not to a later call
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "result": {}})).await;
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized() {
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t"));
        let c = conn.clone();
        let init = tokio::spawn(async move { c.initialize().await });

        let req = peer.recv().await;
        assert_eq!(req["method"], "initialize");
        assert_eq!(req["params"]["protocolVersion"], crate::protocol::PROTOCOL_VERSION);
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "1.0"}
            }
        }))
        .await;

        let result = init.await.unwrap().unwrap();
        assert_eq!(result.server_info.unwrap().name, "fake");
        assert_eq!(conn.capabilities(), Some(json!({"tools": {}})));

        let note = peer.recv().await;
        assert_eq!(note["method"], "notifications/initialized");
        assert!(note.get("id").is_none());
    }

    #[tokio::test]
    async fn test_handshake_error_is_handshake_failed() {
        let (conn, mut peer) = pair(StdioRpcConnection::builder("t"));
        let c = conn.clone();
        let init = tokio::spawn(async move { c.initialize().await });
        let req = peer.recv().await;
        peer.send(json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32600, "message": "bad version"}}))
            .await;
        assert!(matches!(
            init.await.unwrap(),
            Err(SupervisorError::HandshakeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_request_is_refused() {
        let (handler, seen) = collecting_handler();
        let (_conn, mut peer) = pair(StdioRpcConnection::builder("t").on_message(handler));
        peer.send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "sampling/createMessage"}))
            .await;

        let reply = peer.recv().await;
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(matches!(
            seen.lock().unwrap().first(),
            Some(ServerMessage::Request { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_calls() {
        let (conn, _peer) = pair(StdioRpcConnection::builder("t"));
        conn.close();
        assert!(matches!(
            conn.call(Method::Ping, None).await,
            Err(SupervisorError::ProcessDied(_))
        ));
    }
}
