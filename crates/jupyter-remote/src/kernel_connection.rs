//! A client-side session with one remote kernel.
//!
//! A [`KernelConnection`] is a cheap, cloneable handle. The socket, the
//! pending-request table and everything else that changes with the
//! connection belong to a single actor task; handles talk to it over a
//! command channel and observe it through watch and broadcast channels.
//!
//! Shell requests go through a per-kernel [`Sequencer`]: a request is not
//! written to the socket until the kernel reported `idle` for the one before
//! it, so the kernel sees shell requests in submission order and at most one
//! is in flight. Control and stdin messages skip the queue.
//!
//! On socket loss the actor reconnects with backoff. A connection is only
//! `Connected` after a `kernel_info_reply` arrived on the fresh socket.
//! Requests dispatched before the loss either get their reply replayed by
//! the server before that reply, or fail with [`Error::ConnectionLost`].
//! Requests still in the queue are dispatched afterwards, exactly once.
//!
//! A handshake that times out is not a failure by itself: if the kernel sent
//! anything on the new socket, or the server says it is busy, the actor keeps
//! waiting. Only an unresponsive kernel counts towards the retry cap.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jupyter_protocol::{
    CommInfoRequest, CompleteRequest, ExecuteRequest, Header, HistoryEntry, HistoryRequest,
    InputReply, InterruptRequest, JupyterMessage, JupyterMessageContent, KernelInfoRequest,
    ReplyStatus,
};
use jupyter_wire::{Channel, WireMessage};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::comm::{Comm, CommRegistry, CommTarget};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::kernel_manager::{KernelLifecycle, KernelStatus, LifecycleEvent};
use crate::pending::{PendingRequest, PendingTable, ReplySender};
use crate::sequencer::{Sequenced, Sequencer};
use crate::transport::{Frame, FrameSink, KernelSocket, SocketConnector};

/// Major version of the messaging protocol this client speaks.
pub const PROTOCOL_MAJOR: u32 = 5;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_BUFFER: usize = 256;

// ============================================================================
// Connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No socket. Transient: followed by `Reconnecting` or `Closed`.
    Disconnected,
    /// Socket opening or kernel_info handshake in progress.
    Connecting,
    /// Handshake done; shell requests are dispatched.
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
    /// Terminal. Every request fails.
    Closed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

// ============================================================================
// Commands from handles to the actor
// ============================================================================

enum Command {
    Shell(Box<Dispatch>),
    Direct(Direct),
    Shutdown(oneshot::Sender<()>),
}

/// A shell request that reached the head of the queue.
struct Dispatch {
    /// Builds the message at dispatch time; the actor stamps ids on it.
    build: Box<dyn FnOnce() -> JupyterMessage + Send + Sync>,
    timeout: Option<Duration>,
    reply: ReplySender,
    events: mpsc::UnboundedSender<WireMessage>,
    dispatched: oneshot::Sender<String>,
    /// Dropped or fired to let the next queued request go.
    gate: oneshot::Sender<()>,
}

/// A control or stdin message, sent outside the queue.
struct Direct {
    channel: Channel,
    message: JupyterMessage,
    reply: ReplySender,
    /// Wait this long for a `*_reply`; `None` resolves once written.
    expect_reply: Option<Duration>,
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct KernelConnection {
    inner: Arc<Inner>,
}

struct Inner {
    kernel_id: String,
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    queue: Sequencer,
    state: watch::Receiver<ConnectionState>,
    status: watch::Receiver<KernelStatus>,
    messages: broadcast::Sender<WireMessage>,
    comms: CommRegistry,
    request_timeout: Option<Duration>,
}

impl KernelConnection {
    /// Start connecting to `kernel_id`. Returns immediately; requests made
    /// before the handshake completes wait for it.
    pub fn open(
        kernel_id: impl Into<String>,
        connector: Arc<dyn SocketConnector>,
        lifecycle: Arc<dyn KernelLifecycle>,
        config: ConnectionConfig,
    ) -> Self {
        let kernel_id = kernel_id.into();
        let session_id = Uuid::new_v4().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (status_tx, status_rx) = watch::channel(KernelStatus::Unknown);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        let request_timeout = config.request_timeout;
        let comms = CommRegistry::default();

        let actor = Actor {
            kernel_id: kernel_id.clone(),
            session_id: session_id.clone(),
            connector,
            lifecycle_rx: Some(lifecycle.subscribe()),
            lifecycle,
            commands: commands_rx,
            state: state_tx,
            status: status_tx,
            messages: messages.clone(),
            comms: comms.clone(),
            pending: PendingTable::new(kernel_id.clone()),
            held: VecDeque::new(),
            shutdown_acks: Vec::new(),
            failures: 0,
            config,
        };
        tokio::spawn(actor.run());

        info!(
            "[kernel-connection] Opening kernel {} (session {})",
            kernel_id, session_id
        );
        Self {
            inner: Arc::new(Inner {
                queue: Sequencer::new(format!("kernel:{}", kernel_id)),
                kernel_id,
                session_id,
                commands: commands_tx,
                state: state_rx,
                status: status_rx,
                messages,
                comms,
                request_timeout,
            }),
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.inner.kernel_id
    }

    /// Session id sent in every message header and in the socket URL.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Last execution state the kernel reported on iopub.
    pub fn status(&self) -> KernelStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.inner.status.clone()
    }

    /// Every message received from the kernel, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<WireMessage> {
        self.inner.messages.subscribe()
    }

    /// Shell requests queued or in flight.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Resolve once the connection is `Connected`, or fail once it is
    /// `Closed`.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state = self.inner.state.clone();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(self.dead()),
                _ => {}
            }
            if state.changed().await.is_err() {
                // Actor gone; the last value is final.
                return match *state.borrow() {
                    ConnectionState::Connected => Ok(()),
                    _ => Err(self.dead()),
                };
            }
        }
    }

    pub fn execute(&self, request: ExecuteRequest) -> ShellFuture {
        self.send_shell_request(request, self.inner.request_timeout)
    }

    pub fn execute_code(&self, code: &str) -> ShellFuture {
        self.execute(ExecuteRequest::new(code.to_string()))
    }

    /// Queue a shell request. It is written to the socket once every
    /// request queued before it has finished. `timeout` runs from dispatch.
    pub fn send_shell_request<R>(&self, request: R, timeout: Option<Duration>) -> ShellFuture
    where
        R: Into<JupyterMessage> + Send + Sync + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (dispatched_tx, dispatched_rx) = oneshot::channel();
        let commands = self.inner.commands.clone();
        let kernel_id = self.inner.kernel_id.clone();
        let build: Box<dyn FnOnce() -> JupyterMessage + Send + Sync> = Box::new(move || request.into());

        let ticket = self.inner.queue.enqueue(async move {
            let (gate_tx, gate_rx) = oneshot::channel();
            let dispatch = Dispatch {
                build,
                timeout,
                reply: reply_tx,
                events: events_tx,
                dispatched: dispatched_tx,
                gate: gate_tx,
            };
            if let Err(mpsc::error::SendError(command)) =
                commands.send(Command::Shell(Box::new(dispatch)))
            {
                if let Command::Shell(dispatch) = command {
                    let _ = dispatch.reply.send(Err(Error::KernelDead {
                        kernel_id,
                        state: ConnectionState::Closed,
                    }));
                }
                return;
            }
            let _ = gate_rx.await;
        });

        ShellFuture {
            kernel_id: self.inner.kernel_id.clone(),
            ticket,
            reply: reply_rx,
            events: events_rx,
            dispatched: Some(dispatched_rx),
            msg_id: None,
        }
    }

    pub async fn kernel_info(&self) -> Result<WireMessage> {
        self.send_shell_request(KernelInfoRequest::default(), Some(CONTROL_TIMEOUT))
            .reply()
            .await
    }

    pub async fn complete(&self, code: &str, cursor_pos: usize) -> Result<Completion> {
        let request = CompleteRequest {
            code: code.to_string(),
            cursor_pos,
        };
        let reply = self
            .send_shell_request(request, Some(COMPLETE_TIMEOUT))
            .reply()
            .await?;
        match reply.content {
            JupyterMessageContent::CompleteReply(reply) => Ok(Completion {
                matches: reply.matches,
                cursor_start: reply.cursor_start,
                cursor_end: reply.cursor_end,
            }),
            other => Err(Error::Protocol(format!(
                "expected complete_reply, got {}",
                other.message_type()
            ))),
        }
    }

    /// Search the kernel's input history. `pattern` is a glob; `None`
    /// matches everything.
    pub async fn history(
        &self,
        pattern: Option<&str>,
        n: i32,
        unique: bool,
    ) -> Result<Vec<HistoryItem>> {
        let request = HistoryRequest::Search {
            pattern: pattern.unwrap_or("*").to_string(),
            unique,
            output: false,
            raw: true,
            n,
        };
        let reply = self
            .send_shell_request(request, Some(HISTORY_TIMEOUT))
            .reply()
            .await?;
        let reply = match reply.content {
            JupyterMessageContent::HistoryReply(reply) => reply,
            other => {
                return Err(Error::Protocol(format!(
                    "expected history_reply, got {}",
                    other.message_type()
                )))
            }
        };
        Ok(reply
            .history
            .iter()
            .map(|entry| match entry {
                HistoryEntry::Input(session, line, source)
                | HistoryEntry::InputOutput(session, line, (source, _)) => HistoryItem {
                    session: *session as i64,
                    line: *line as i64,
                    source: source.clone(),
                },
            })
            .collect())
    }

    /// Send `interrupt_request` on control. Queued and in-flight shell
    /// requests are left alone; the running one usually finishes with an
    /// error reply.
    pub async fn interrupt(&self) -> Result<WireMessage> {
        self.send_control(InterruptRequest {}, CONTROL_TIMEOUT).await
    }

    /// Send a control request and wait for its reply.
    pub async fn send_control<R>(&self, request: R, timeout: Duration) -> Result<WireMessage>
    where
        R: Into<JupyterMessage>,
    {
        self.send_direct(Channel::Control, request.into(), Some(timeout))
            .await
    }

    /// Answer an `input_request` on stdin.
    pub async fn send_stdin(&self, value: &str, parent: &Header) -> Result<()> {
        let reply = InputReply {
            value: value.to_string(),
            status: ReplyStatus::Ok,
            error: None,
        };
        let mut message: JupyterMessage = reply.into();
        message.parent_header = Some(parent.clone());
        self.send_direct(Channel::Stdin, message, None).await?;
        Ok(())
    }

    /// A comm towards `target_name` on the kernel. Nothing is sent until
    /// [`Comm::open`]. A fresh id is generated when `comm_id` is `None`.
    pub fn create_comm(&self, target_name: &str, comm_id: Option<String>) -> Comm {
        let comm_id = comm_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let messages = self.inner.comms.open(&comm_id);
        Comm::new(self.clone(), comm_id, target_name.to_string(), messages)
    }

    pub fn has_comm(&self, comm_id: &str) -> bool {
        self.inner.comms.contains(comm_id)
    }

    /// Receive the comms the kernel opens towards `target_name`. Registering
    /// the same name again replaces the earlier target.
    pub fn register_comm_target(&self, target_name: &str) -> CommTarget {
        let opened = self.inner.comms.add_target(target_name);
        CommTarget::new(self.clone(), target_name.to_string(), opened)
    }

    /// Comms open on the kernel, as comm id to target name.
    pub async fn comm_info(&self, target_name: Option<&str>) -> Result<HashMap<String, String>> {
        let request = CommInfoRequest {
            target_name: target_name.map(str::to_string),
        };
        let reply = self
            .send_shell_request(request, Some(CONTROL_TIMEOUT))
            .reply()
            .await?;
        match reply.content {
            JupyterMessageContent::CommInfoReply(reply) => Ok(reply
                .comms
                .into_iter()
                .map(|(comm_id, info)| (comm_id.0, info.target_name))
                .collect()),
            other => Err(Error::Protocol(format!(
                "expected comm_info_reply, got {}",
                other.message_type()
            ))),
        }
    }

    pub(crate) fn comms(&self) -> &CommRegistry {
        &self.inner.comms
    }

    /// Close the connection. Every pending and queued request fails with
    /// [`Error::KernelDead`]. Does not shut the kernel down.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    async fn send_direct(
        &self,
        channel: Channel,
        message: JupyterMessage,
        expect_reply: Option<Duration>,
    ) -> Result<WireMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let direct = Direct {
            channel,
            message,
            reply: reply_tx,
            expect_reply,
        };
        if self.inner.commands.send(Command::Direct(direct)).is_err() {
            return Err(self.dead());
        }
        reply_rx.await.map_err(|_| self.dead())?
    }

    pub(crate) fn dead(&self) -> Error {
        Error::KernelDead {
            kernel_id: self.inner.kernel_id.clone(),
            state: ConnectionState::Closed,
        }
    }
}

impl fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelConnection")
            .field("kernel_id", &self.inner.kernel_id)
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Completion candidates for the text before the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

/// One input from the kernel's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryItem {
    pub session: i64,
    pub line: i64,
    pub source: String,
}

/// Outcome of a queued shell request.
///
/// Dropping it does not cancel the request; use [`ShellFuture::withdraw`]
/// while it is still queued.
pub struct ShellFuture {
    kernel_id: String,
    ticket: Sequenced<()>,
    reply: oneshot::Receiver<Result<WireMessage>>,
    events: mpsc::UnboundedReceiver<WireMessage>,
    dispatched: Option<oneshot::Receiver<String>>,
    msg_id: Option<String>,
}

impl ShellFuture {
    /// Remove the request from the queue. `false` once it was dispatched.
    pub fn withdraw(&self) -> bool {
        self.ticket.withdraw()
    }

    /// The id the request went out with. Waits for dispatch.
    pub async fn msg_id(&mut self) -> Result<String> {
        if let Some(msg_id) = &self.msg_id {
            return Ok(msg_id.clone());
        }
        let Some(dispatched) = self.dispatched.take() else {
            return Err(self.failure());
        };
        match dispatched.await {
            Ok(msg_id) => {
                self.msg_id = Some(msg_id.clone());
                Ok(msg_id)
            }
            Err(_) => Err(self.failure()),
        }
    }

    /// Next iopub or stdin message caused by this request. `None` once the
    /// request is finished (reply and idle seen) or has failed.
    pub async fn next_event(&mut self) -> Option<WireMessage> {
        self.events.recv().await
    }

    /// The terminal `*_reply`.
    pub async fn reply(self) -> Result<WireMessage> {
        match self.reply.await {
            Ok(outcome) => outcome,
            Err(_) if self.ticket.is_withdrawn() => Err(Error::Withdrawn),
            Err(_) => Err(Error::KernelDead {
                kernel_id: self.kernel_id,
                state: ConnectionState::Closed,
            }),
        }
    }

    fn failure(&self) -> Error {
        if self.ticket.is_withdrawn() {
            Error::Withdrawn
        } else {
            Error::KernelDead {
                kernel_id: self.kernel_id.clone(),
                state: ConnectionState::Closed,
            }
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Exit {
    /// Socket gone; try again.
    Lost(String),
    /// Terminal.
    Close(Error),
}

enum Inbound {
    Continue,
    /// Handshake reply arrived and the protocol version is acceptable.
    Ready,
    Close(Error),
}

struct Handshake {
    msg_id: String,
    deadline: Instant,
}

/// What to do about a handshake past its deadline.
enum Overdue {
    /// The kernel is alive; give it another period.
    Wait,
    Lost(String),
    Close(Error),
}

struct Actor {
    kernel_id: String,
    session_id: String,
    config: ConnectionConfig,
    connector: Arc<dyn SocketConnector>,
    lifecycle: Arc<dyn KernelLifecycle>,
    lifecycle_rx: Option<broadcast::Receiver<LifecycleEvent>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    status: watch::Sender<KernelStatus>,
    messages: broadcast::Sender<WireMessage>,
    comms: CommRegistry,
    pending: PendingTable,
    /// Shell requests that reached the actor while it could not send.
    held: VecDeque<Box<Dispatch>>,
    shutdown_acks: Vec<oneshot::Sender<()>>,
    /// Consecutive failed attempts; reset by a completed handshake.
    failures: u32,
}

impl Actor {
    async fn run(mut self) {
        let reason = loop {
            self.set_state(ConnectionState::Connecting);
            let exit = match self.connect().await {
                Ok(socket) => self.serve(socket).await,
                Err(exit) => exit,
            };
            let why = match exit {
                Exit::Close(reason) => break reason,
                Exit::Lost(why) => why,
            };

            warn!(
                "[kernel-connection] Lost kernel {}: {}",
                self.kernel_id, why
            );
            self.set_state(ConnectionState::Disconnected);
            self.pending
                .connection_lost(self.config.lost_request_grace, ConnectionState::Disconnected);

            self.failures += 1;
            if !self.config.reconnect.allows(self.failures) {
                error!(
                    "[kernel-connection] Giving up on kernel {} after {} failed attempts",
                    self.kernel_id, self.failures
                );
                break self.dead();
            }
            if let Err(reason) = self.backoff().await {
                break reason;
            }
        };
        self.close(reason);
    }

    async fn connect(&mut self) -> std::result::Result<KernelSocket, Exit> {
        let mut connecting = self.connector.connect(&self.kernel_id, &self.session_id);
        loop {
            let deadline = self.pending.next_deadline();
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok(socket) => Ok(socket),
                        Err(error @ Error::Auth { .. }) => {
                            error!("[kernel-connection] Kernel {}: {}", self.kernel_id, error);
                            Err(Exit::Close(error))
                        }
                        Err(Error::NotFound(what)) => {
                            warn!("[kernel-connection] {} no longer exists", what);
                            Err(Exit::Close(self.dead()))
                        }
                        Err(error) => Err(Exit::Lost(error.to_string())),
                    };
                }
                command = self.commands.recv() => {
                    if let Some(reason) = self.offline_command(command) {
                        return Err(Exit::Close(reason));
                    }
                }
                event = next_lifecycle_event(&mut self.lifecycle_rx) => {
                    if let Some(reason) = self.offline_lifecycle(event) {
                        return Err(Exit::Close(reason));
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    self.pending.expire(Instant::now(), ConnectionState::Connecting);
                }
            }
        }
    }

    async fn backoff(&mut self) -> std::result::Result<(), Error> {
        self.set_state(ConnectionState::Reconnecting);
        let delay = self.config.reconnect.delay(self.failures);
        info!(
            "[kernel-connection] Reconnecting to kernel {} in {:?} (attempt {}/{})",
            self.kernel_id, delay, self.failures, self.config.reconnect.max_attempts
        );
        let wake = Instant::now() + delay;
        loop {
            let deadline = self.pending.next_deadline();
            tokio::select! {
                _ = sleep_until(wake) => return Ok(()),
                command = self.commands.recv() => {
                    if let Some(reason) = self.offline_command(command) {
                        return Err(reason);
                    }
                }
                event = next_lifecycle_event(&mut self.lifecycle_rx) => {
                    if let Some(reason) = self.offline_lifecycle(event) {
                        return Err(reason);
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    self.pending.expire(Instant::now(), ConnectionState::Reconnecting);
                }
            }
        }
    }

    async fn serve(&mut self, socket: KernelSocket) -> Exit {
        let KernelSocket {
            mut sink,
            mut stream,
        } = socket;

        debug!(
            "[kernel-connection] Socket open for kernel {}, sending kernel_info_request",
            self.kernel_id
        );
        let mut handshake = match self.start_handshake(&mut sink).await {
            Ok(handshake) => Some(handshake),
            Err(e) => return Exit::Lost(e.to_string()),
        };

        let max_missed = self.config.heartbeat.map(|hb| hb.max_missed).unwrap_or(0);
        let mut heartbeat = self.config.heartbeat.map(|hb| {
            let mut interval = interval_at(Instant::now() + hb.interval, hb.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut missed = 0u32;
        // Anything decoded since the handshake deadline was last set.
        let mut heard_from_kernel = false;

        loop {
            let deadline = earliest(
                self.pending.next_deadline(),
                handshake.as_ref().map(|h| h.deadline),
            );

            tokio::select! {
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return Exit::Lost(e.to_string()),
                        None => return Exit::Lost("socket closed".to_string()),
                    };
                    match frame {
                        Frame::Pong(_) => missed = 0,
                        // Answered by the WebSocket layer.
                        Frame::Ping(_) => {}
                        Frame::Close => return Exit::Lost("server closed the socket".to_string()),
                        data => match data.decode() {
                            Ok(Some(message)) => {
                                heard_from_kernel = true;
                                match self.inbound(message, &mut handshake) {
                                    Inbound::Continue => {}
                                    Inbound::Ready => {
                                        if let Err(e) = self.on_ready(&mut sink).await {
                                            return Exit::Lost(e.to_string());
                                        }
                                    }
                                    Inbound::Close(reason) => return Exit::Close(reason),
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(
                                "[kernel-connection] Dropping frame from kernel {}: {}",
                                self.kernel_id, e
                            ),
                        },
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        None => return Exit::Close(self.dead()),
                        Some(Command::Shutdown(done)) => {
                            self.shutdown_acks.push(done);
                            return Exit::Close(self.dead());
                        }
                        Some(Command::Shell(dispatch)) => {
                            if handshake.is_some() || !self.held.is_empty() {
                                self.held.push_back(dispatch);
                            } else if let Err(e) = self.dispatch(dispatch, &mut sink).await {
                                return Exit::Lost(e.to_string());
                            }
                        }
                        Some(Command::Direct(direct)) => {
                            if let Err(e) = self.send_direct(direct, &mut sink).await {
                                return Exit::Lost(e.to_string());
                            }
                        }
                    }
                }
                _ = tick(&mut heartbeat) => {
                    if missed >= max_missed {
                        return Exit::Lost(format!("{} pings unanswered", missed));
                    }
                    if let Err(e) = sink.send(Frame::Ping(Vec::new())).await {
                        return Exit::Lost(e.to_string());
                    }
                    missed += 1;
                }
                event = next_lifecycle_event(&mut self.lifecycle_rx) => {
                    if event.kernel_id() != self.kernel_id {
                        continue;
                    }
                    match event {
                        LifecycleEvent::Restarted { .. } => {
                            info!(
                                "[kernel-connection] Kernel {} restarted, handshaking again",
                                self.kernel_id
                            );
                            let lost = self.lost();
                            self.pending.fail_shell(&lost);
                            self.comms.close_all();
                            match self.start_handshake(&mut sink).await {
                                Ok(fresh) => {
                                    handshake = Some(fresh);
                                    heard_from_kernel = false;
                                }
                                Err(e) => return Exit::Lost(e.to_string()),
                            }
                        }
                        LifecycleEvent::ShutDown { .. } | LifecycleEvent::Died { .. } => {
                            info!("[kernel-connection] Kernel {} is gone", self.kernel_id);
                            return Exit::Close(self.dead());
                        }
                        LifecycleEvent::Started { .. } => {}
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    let now = Instant::now();
                    if handshake.as_ref().is_some_and(|h| h.deadline <= now) {
                        match self.handshake_overdue(heard_from_kernel).await {
                            Overdue::Wait => {
                                let extended = Instant::now() + self.config.handshake_timeout;
                                if let Some(pending) = handshake.as_mut() {
                                    pending.deadline = extended;
                                }
                                heard_from_kernel = false;
                            }
                            Overdue::Lost(why) => return Exit::Lost(why),
                            Overdue::Close(reason) => return Exit::Close(reason),
                        }
                    }
                    let state = *self.state.borrow();
                    self.pending.expire(now, state);
                }
            }
        }
    }

    async fn start_handshake(&mut self, sink: &mut FrameSink) -> Result<Handshake> {
        let message = self.outbound(KernelInfoRequest::default().into(), Channel::Shell);
        let frame = Frame::encode(&message)?;
        sink.send(frame).await?;
        Ok(Handshake {
            msg_id: message.msg_id().to_string(),
            deadline: Instant::now() + self.config.handshake_timeout,
        })
    }

    /// Decide whether a handshake past its deadline means the socket is
    /// useless. A kernel that talked on this socket, or that the server
    /// reports as working, is only slow.
    async fn handshake_overdue(&self, heard_from_kernel: bool) -> Overdue {
        if heard_from_kernel {
            debug!(
                "[kernel-connection] Kernel {} is talking but has not answered kernel_info yet",
                self.kernel_id
            );
            return Overdue::Wait;
        }

        let asked = tokio::time::timeout(
            self.config.handshake_timeout,
            self.lifecycle.server_status(&self.kernel_id),
        )
        .await;
        match asked {
            Ok(Ok(Some(status))) if status.is_working() => {
                info!(
                    "[kernel-connection] Kernel {} is {}, still waiting for kernel_info_reply",
                    self.kernel_id, status
                );
                Overdue::Wait
            }
            Ok(Ok(Some(KernelStatus::Dead))) | Ok(Ok(None)) => {
                warn!(
                    "[kernel-connection] Kernel {} is gone from the server",
                    self.kernel_id
                );
                Overdue::Close(self.dead())
            }
            Ok(Ok(Some(status))) => Overdue::Lost(format!(
                "kernel_info_request timed out (server reports {})",
                status
            )),
            Ok(Err(error @ Error::Auth { .. })) => {
                error!("[kernel-connection] Kernel {}: {}", self.kernel_id, error);
                Overdue::Close(error)
            }
            Ok(Err(error)) => Overdue::Lost(format!(
                "kernel_info_request timed out, status check failed: {}",
                error
            )),
            Err(_) => Overdue::Lost("kernel_info_request timed out".to_string()),
        }
    }

    async fn on_ready(&mut self, sink: &mut FrameSink) -> Result<()> {
        self.set_state(ConnectionState::Connected);
        self.failures = 0;
        self.pending.reconcile(ConnectionState::Connected);
        while let Some(dispatch) = self.held.pop_front() {
            self.dispatch(dispatch, sink).await?;
        }
        Ok(())
    }

    fn inbound(&mut self, message: WireMessage, handshake: &mut Option<Handshake>) -> Inbound {
        debug!(
            "[kernel-connection] <- {} {} (parent {:?})",
            message.channel,
            message.msg_type(),
            message.parent_msg_id()
        );
        let _ = self.messages.send(message.clone());

        if let Some(state) = message.execution_state() {
            let status = KernelStatus::from(state);
            self.status.send_replace(status);
            self.lifecycle.record_status(&self.kernel_id, status);
            if status == KernelStatus::Dead {
                warn!("[kernel-connection] Kernel {} reported dead", self.kernel_id);
                return Inbound::Close(self.dead());
            }
        }

        let answers_handshake = handshake.as_ref().is_some_and(|pending| {
            message.msg_type() == "kernel_info_reply"
                && message.parent_msg_id() == Some(pending.msg_id.as_str())
        });
        if answers_handshake {
            *handshake = None;
            return match check_protocol(&message) {
                Ok(version) => {
                    info!(
                        "[kernel-connection] Kernel {} ready (protocol {})",
                        self.kernel_id, version
                    );
                    Inbound::Ready
                }
                Err(e) => {
                    error!("[kernel-connection] Kernel {}: {}", self.kernel_id, e);
                    Inbound::Close(e)
                }
            };
        }

        self.pending.route(&message);
        self.comms.route(&message);
        Inbound::Continue
    }

    async fn dispatch(&mut self, dispatch: Box<Dispatch>, sink: &mut FrameSink) -> Result<()> {
        let Dispatch {
            build,
            timeout,
            reply,
            events,
            dispatched,
            gate,
        } = *dispatch;

        let message = self.outbound(build(), Channel::Shell);
        let frame = match Frame::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                // Nothing was sent; fail just this request.
                let _ = reply.send(Err(e));
                drop(gate);
                return Ok(());
            }
        };
        let msg_id = message.msg_id().to_string();
        self.pending.insert(
            msg_id.clone(),
            PendingRequest::shell(message.msg_type(), reply, events, gate, timeout),
        );
        let _ = dispatched.send(msg_id.clone());
        debug!(
            "[kernel-connection] -> shell {} {}",
            message.msg_type(),
            msg_id
        );
        sink.send(frame).await
    }

    async fn send_direct(&mut self, direct: Direct, sink: &mut FrameSink) -> Result<()> {
        let Direct {
            channel,
            message,
            reply,
            expect_reply,
        } = direct;

        let message = self.outbound(message, channel);
        let frame = match Frame::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };
        debug!(
            "[kernel-connection] -> {} {} {}",
            channel,
            message.msg_type(),
            message.msg_id()
        );

        match expect_reply {
            Some(timeout) => {
                self.pending.insert(
                    message.msg_id().to_string(),
                    PendingRequest::control(message.msg_type(), reply, timeout),
                );
                sink.send(frame).await
            }
            None => match sink.send(frame).await {
                Ok(()) => {
                    let _ = reply.send(Ok(message));
                    Ok(())
                }
                Err(e) => {
                    let _ = reply.send(Err(self.lost()));
                    Err(e)
                }
            },
        }
    }

    /// Stamp a fresh message id and our session on an outgoing message.
    fn outbound(&self, mut message: JupyterMessage, channel: Channel) -> WireMessage {
        message.header.msg_id = Uuid::new_v4().to_string();
        message.header.session = self.session_id.clone();
        WireMessage::from_jupyter(message, channel)
    }

    /// Handle a command while there is no usable socket.
    fn offline_command(&mut self, command: Option<Command>) -> Option<Error> {
        match command {
            None => {
                debug!(
                    "[kernel-connection] Every handle to kernel {} dropped",
                    self.kernel_id
                );
                Some(self.dead())
            }
            Some(Command::Shell(dispatch)) => {
                self.held.push_back(dispatch);
                None
            }
            Some(Command::Direct(direct)) => {
                let _ = direct.reply.send(Err(self.lost()));
                None
            }
            Some(Command::Shutdown(done)) => {
                self.shutdown_acks.push(done);
                Some(self.dead())
            }
        }
    }

    fn offline_lifecycle(&mut self, event: LifecycleEvent) -> Option<Error> {
        if event.kernel_id() != self.kernel_id {
            return None;
        }
        match event {
            LifecycleEvent::Restarted { .. } => {
                // Whatever was running died with the old process.
                let lost = self.lost();
                self.pending.fail_shell(&lost);
                self.comms.close_all();
                None
            }
            LifecycleEvent::ShutDown { .. } | LifecycleEvent::Died { .. } => {
                info!("[kernel-connection] Kernel {} is gone", self.kernel_id);
                Some(self.dead())
            }
            LifecycleEvent::Started { .. } => None,
        }
    }

    fn close(mut self, reason: Error) {
        info!(
            "[kernel-connection] Closing kernel {}: {}",
            self.kernel_id, reason
        );
        self.set_state(ConnectionState::Closed);
        self.comms.close_all();
        self.commands.close();
        self.pending.fail_all(&reason);
        for dispatch in self.held.drain(..) {
            let _ = dispatch.reply.send(Err(reason.clone()));
        }
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Shell(dispatch) => {
                    let _ = dispatch.reply.send(Err(reason.clone()));
                }
                Command::Direct(direct) => {
                    let _ = direct.reply.send(Err(reason.clone()));
                }
                Command::Shutdown(done) => self.shutdown_acks.push(done),
            }
        }
        for done in self.shutdown_acks.drain(..) {
            let _ = done.send(());
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("[kernel-connection] Kernel {} is {}", self.kernel_id, next);
        }
    }

    /// Every way the actor gives up ends in `Closed`, so that is the state
    /// reported, even while the watch still shows the previous one.
    fn dead(&self) -> Error {
        Error::KernelDead {
            kernel_id: self.kernel_id.clone(),
            state: ConnectionState::Closed,
        }
    }

    fn lost(&self) -> Error {
        Error::ConnectionLost {
            kernel_id: self.kernel_id.clone(),
            state: *self.state.borrow(),
        }
    }
}

fn check_protocol(message: &WireMessage) -> Result<String> {
    let JupyterMessageContent::KernelInfoReply(reply) = &message.content else {
        return Err(Error::Protocol(format!(
            "unreadable kernel_info_reply {}",
            message.msg_id()
        )));
    };
    let major = reply
        .protocol_version
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok());
    if major == Some(PROTOCOL_MAJOR) {
        Ok(reply.protocol_version.clone())
    } else {
        Err(Error::Protocol(format!(
            "kernel speaks protocol {}, expected {}.x",
            reply.protocol_version, PROTOCOL_MAJOR
        )))
    }
}

async fn next_lifecycle_event(
    events: &mut Option<broadcast::Receiver<LifecycleEvent>>,
) -> LifecycleEvent {
    loop {
        let Some(receiver) = events.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("[kernel-connection] Missed {} lifecycle events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => *events = None,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
