//! Fixtures shared by unit tests: message builders, an in-memory socket
//! connector with a scriptable fake kernel on the far side, and a
//! lifecycle source the tests can drive by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use jupyter_wire::decode_binary;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::backoff::ReconnectPolicy;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::kernel_manager::{KernelLifecycle, KernelStatus, LifecycleEvent};
use crate::transport::{Frame, KernelSocket, SocketConnector};

// ============================================================================
// Message builders
// ============================================================================

pub(crate) fn request_header(msg_id: &str, msg_type: &str) -> Value {
    json!({
        "msg_id": msg_id,
        "msg_type": msg_type,
        "session": "client-session",
        "username": "test",
        "date": "2025-05-14T14:32:23.490Z",
        "version": "5.3",
    })
}

pub(crate) fn message(msg_type: &str, channel: &str, parent: Option<&Value>, content: Value) -> Value {
    json!({
        "header": {
            "msg_id": Uuid::new_v4().to_string(),
            "msg_type": msg_type,
            "session": "fake-kernel",
            "username": "kernel",
            "date": "2025-05-14T14:32:23.490Z",
            "version": "5.3",
        },
        "parent_header": parent.cloned().unwrap_or_else(|| json!({})),
        "metadata": {},
        "content": content,
        "channel": channel,
    })
}

pub(crate) fn status(parent: Option<&Value>, state: &str) -> Value {
    message("status", "iopub", parent, json!({"execution_state": state}))
}

pub(crate) fn kernel_info_content(protocol_version: &str) -> Value {
    json!({
        "status": "ok",
        "protocol_version": protocol_version,
        "implementation": "ipykernel",
        "implementation_version": "6.29.0",
        "language_info": {
            "name": "python",
            "version": "3.12.1",
            "mimetype": "text/x-python",
            "file_extension": ".py",
            "pygments_lexer": "ipython3",
            "codemirror_mode": {"name": "ipython", "version": 3},
            "nbconvert_exporter": "python"
        },
        "banner": "Python 3.12.1",
        "help_links": [],
        "debugger": false
    })
}

pub(crate) fn execute_reply_content(execution_count: u32) -> Value {
    json!({
        "status": "ok",
        "execution_count": execution_count,
        "payload": [],
        "user_expressions": {}
    })
}

pub(crate) fn msg_id(request: &Value) -> String {
    request["header"]["msg_id"]
        .as_str()
        .expect("request has a msg_id")
        .to_string()
}

pub(crate) fn msg_type(request: &Value) -> String {
    request["header"]["msg_type"]
        .as_str()
        .expect("request has a msg_type")
        .to_string()
}

/// Connection settings tuned for paused-clock tests.
pub(crate) fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
            max_attempts: 3,
        },
        heartbeat: None,
        request_timeout: None,
        handshake_timeout: Duration::from_secs(5),
        lost_request_grace: Duration::from_secs(10),
    }
}

// ============================================================================
// In-memory sockets
// ============================================================================

/// The kernel side of one in-memory socket.
pub(crate) struct ServerEnd {
    frames: mpsc::UnboundedReceiver<Frame>,
    outbound: fmpsc::UnboundedSender<Result<Frame>>,
}

impl ServerEnd {
    pub(crate) fn send(&self, value: Value) {
        self.send_frame(Frame::Text(value.to_string()));
    }

    pub(crate) fn send_frame(&self, frame: Frame) {
        let _ = self.outbound.unbounded_send(Ok(frame));
    }

    /// Next message the client sent, as JSON.
    pub(crate) async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(600), self.frames.recv())
            .await
            .expect("client sent nothing")
            .expect("client went away");
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).expect("client sent valid JSON"),
            Frame::Binary(bytes) => {
                let message = decode_binary(&bytes).expect("client sent a valid binary frame");
                serde_json::to_value(&message).expect("message serializes")
            }
            other => panic!("unexpected frame from client: {:?}", other),
        }
    }

    pub(crate) async fn recv_request(&mut self, expected_type: &str) -> Value {
        let request = self.recv().await;
        assert_eq!(msg_type(&request), expected_type, "got {}", request);
        request
    }

    /// Fail if the client sends anything within `wait`.
    pub(crate) async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(wait, self.frames.recv()).await {
            panic!("expected silence, client sent {:?}", frame);
        }
    }

    /// Answer a `kernel_info_request` the way ipykernel does.
    pub(crate) fn answer_kernel_info(&self, request: &Value, protocol_version: &str) {
        let parent = &request["header"];
        self.send(status(Some(parent), "busy"));
        self.send(message(
            "kernel_info_reply",
            "shell",
            Some(parent),
            kernel_info_content(protocol_version),
        ));
        self.send(status(Some(parent), "idle"));
    }

    /// Wait for the handshake request and complete it.
    pub(crate) async fn handshake(&mut self) -> Value {
        let request = self.recv_request("kernel_info_request").await;
        self.answer_kernel_info(&request, "5.3");
        request
    }

    /// Run an `execute_request` to completion: busy, output, reply, idle.
    pub(crate) fn finish_execute(&self, request: &Value, execution_count: u32, stdout: &str) {
        let parent = &request["header"];
        self.send(status(Some(parent), "busy"));
        self.send(message(
            "stream",
            "iopub",
            Some(parent),
            json!({"name": "stdout", "text": stdout}),
        ));
        self.send(message(
            "execute_reply",
            "shell",
            Some(parent),
            execute_reply_content(execution_count),
        ));
        self.send(status(Some(parent), "idle"));
    }

    pub(crate) fn close(self) {
        drop(self);
    }
}

impl Drop for ServerEnd {
    fn drop(&mut self) {
        self.outbound.close_channel();
    }
}

/// Hands out in-memory sockets. Each successful `connect` delivers the
/// kernel side on the receiver returned by [`MemoryConnector::new`].
pub(crate) struct MemoryConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
    failures: Mutex<VecDeque<Error>>,
    refuse_all: Mutex<Option<Error>>,
    attempts: AtomicUsize,
    auto_pong: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            failures: Mutex::new(VecDeque::new()),
            refuse_all: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            auto_pong: Arc::new(AtomicBool::new(true)),
        });
        (connector, rx)
    }

    pub(crate) fn fail_next(&self, error: Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn refuse_all(&self, error: Error) {
        *self.refuse_all.lock().unwrap() = Some(error);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether the fake kernel side answers pings.
    pub(crate) fn set_auto_pong(&self, on: bool) {
        self.auto_pong.store(on, Ordering::SeqCst);
    }
}

impl SocketConnector for MemoryConnector {
    fn connect(&self, _kernel_id: &str, _session_id: &str) -> BoxFuture<'static, Result<KernelSocket>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.refuse_all.lock().unwrap().clone() {
            return future::ready(Err(error)).boxed();
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return future::ready(Err(error)).boxed();
        }

        let (client_tx, mut client_rx) = fmpsc::unbounded::<Frame>();
        let (server_tx, server_rx) = fmpsc::unbounded::<Result<Frame>>();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let pong_tx = server_tx.clone();
        let auto_pong = Arc::clone(&self.auto_pong);
        tokio::spawn(async move {
            while let Some(frame) = client_rx.next().await {
                match frame {
                    Frame::Ping(payload) => {
                        if auto_pong.load(Ordering::SeqCst) {
                            let _ = pong_tx.unbounded_send(Ok(Frame::Pong(payload)));
                        }
                    }
                    other => {
                        if frames_tx.send(other).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let _ = self.servers.send(ServerEnd {
            frames: frames_rx,
            outbound: server_tx,
        });
        let sink = client_tx.sink_map_err(|e| Error::Network(e.to_string()));
        future::ready(Ok(KernelSocket::new(sink, server_rx))).boxed()
    }
}

/// Wait for the next socket the client opens.
pub(crate) async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(600), servers.recv())
        .await
        .expect("client never connected")
        .expect("connector dropped")
}

// ============================================================================
// Lifecycle
// ============================================================================

pub(crate) struct FakeLifecycle {
    events: broadcast::Sender<LifecycleEvent>,
    statuses: Mutex<Vec<(String, KernelStatus)>>,
    /// What `GET /api/kernels/{id}` would say.
    server_status: Mutex<Option<KernelStatus>>,
    status_checks: AtomicUsize,
}

impl FakeLifecycle {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            events,
            statuses: Mutex::new(Vec::new()),
            server_status: Mutex::new(Some(KernelStatus::Idle)),
            status_checks: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_server_status(&self, status: Option<KernelStatus>) {
        *self.server_status.lock().unwrap() = status;
    }

    pub(crate) fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn statuses(&self) -> Vec<(String, KernelStatus)> {
        self.statuses.lock().unwrap().clone()
    }
}

impl KernelLifecycle for FakeLifecycle {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn record_status(&self, kernel_id: &str, status: KernelStatus) {
        self.statuses
            .lock()
            .unwrap()
            .push((kernel_id.to_string(), status));
    }

    fn server_status<'a>(
        &'a self,
        _kernel_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<KernelStatus>>> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        let status = *self.server_status.lock().unwrap();
        future::ready(Ok(status)).boxed()
    }
}
