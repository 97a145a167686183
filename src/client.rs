//! Client builder, session handle, and the loop that drives a connection.
//!
//! The [`ClientBuilder`] configures a session. [`ClientBuilder::connect`]
//! spawns one thread running a [`ClientLoop`], which owns the socket:
//! 1. Finish the transport connect
//! 2. Send `init` and wait for the peer's `init`
//! 3. Write queued commando requests
//! 4. Read frames, answer pings, and complete requests
//!
//! Callers talk to the loop through a [`Session`]. Each submission goes
//! over a channel and wakes the loop's readiness wait; results come back
//! through a per-request oneshot.
//!
//! # Example
//!
//! ```no_run
//! use lnlink::ClientBuilder;
//! use serde_json::json;
//!
//! let session = ClientBuilder::new()
//!     .rune("tU-RLjMiDpY2U0o3W1oFowar36RFGpWloPbW9-RuZdo9MyZpZD0wMmQ4")
//!     .connect("03f3c108ccd536b8526841f0a5c58212bb9e6584a1eb493080e7c1cc34f82dad71@127.0.0.1:9735")?;
//!
//! let info = session.call("getinfo", json!({}), None)?;
//! println!("{}", info["alias"]);
//! session.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::address::NodeAddress;
use crate::correlator::{Completion, Correlator, Delivery};
use crate::error::{CallError, ConnectError, SessionError};
use crate::mux::{DescriptorSet, Interest, MuxError, Multiplexer, Token, Waker};
use crate::protocol::{
    build_frame, init_body, msg_type, pong_for, Frame, InboundBuffer, MAX_MESSAGE_SIZE,
};
use crate::transport::{ReadOutcome, TcpTransport, Transport, WriteOutcome};

/// Default time allowed for the TCP connect plus `init` exchange.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-request deadline when a call passes `None`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(8);

/// Default size of a single socket read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Default cap on a reassembled reply.
pub const DEFAULT_MAX_REPLY_SIZE: usize = 16 * 1024 * 1024;

/// Reads per turn before writes and deadlines get a chance to run.
const MAX_READS_PER_TURN: usize = 16;

/// Token of the session socket in the loop's descriptor set.
const SESSION: Token = Token(1);

/// Settings shared by the builder and the loop.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Rune attached to every request.
    pub rune: String,
    /// Largest accepted length prefix.
    pub max_frame_size: usize,
    /// Largest accepted reassembled reply.
    pub max_reply_size: usize,
    /// Deadline for reaching `Ready`.
    pub connect_timeout: Duration,
    /// Deadline for calls that do not pass one.
    pub default_timeout: Duration,
    /// Bytes requested per socket read.
    pub read_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rune: String::new(),
            max_frame_size: MAX_MESSAGE_SIZE,
            max_reply_size: DEFAULT_MAX_REPLY_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_timeout: DEFAULT_CALL_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Builder for configuring and opening a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rune used to authorize requests.
    pub fn rune(mut self, rune: impl Into<String>) -> Self {
        self.config.rune = rune.into();
        self
    }

    /// Set the maximum inbound frame length.
    ///
    /// Values above 65535 are clamped.
    /// Default: 65535
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the maximum reassembled reply size.
    ///
    /// Default: 16 MiB
    pub fn max_reply_size(mut self, size: usize) -> Self {
        self.config.max_reply_size = size;
        self
    }

    /// Set the connect + handshake timeout.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the deadline applied to calls that pass `None`.
    ///
    /// Default: 8 seconds
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the per-read buffer size.
    ///
    /// Default: 64 KiB
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve `address` (`<node_id>@<host>[:port]`), connect, and wait
    /// until the session is ready.
    pub fn connect(self, address: &str) -> Result<Session, ConnectError> {
        let address: NodeAddress = address.parse()?;
        tracing::debug!("Connecting to {}", address);
        self.connect_addrs(address.resolve()?)
    }

    /// Try `addrs` in order and run a session over the first that accepts.
    ///
    /// The connect timeout bounds all attempts together.
    pub fn connect_addrs(
        self,
        addrs: impl IntoIterator<Item = SocketAddr>,
    ) -> Result<Session, ConnectError> {
        let deadline = Instant::now().checked_add(self.config.connect_timeout);
        let mut last_err = None;

        for addr in addrs {
            let remaining = deadline.map_or(self.config.connect_timeout, |d| {
                d.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() {
                return Err(ConnectError::Timeout);
            }

            match TcpTransport::connect_timeout(addr, remaining) {
                Ok(transport) => {
                    tracing::debug!("Connected via {}", addr);
                    return self.connect_transport(transport);
                }
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == io::ErrorKind::TimedOut => ConnectError::Timeout,
            Some(e) => ConnectError::Io(e),
            None => ConnectError::Closed,
        })
    }

    /// Run a session over an existing transport on a new thread and wait
    /// until it is ready.
    pub fn connect_transport<T: Transport>(self, transport: T) -> Result<Session, ConnectError> {
        let (mut client_loop, mut session) = self.build_loop(transport)?;
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        client_loop.notify_ready(ready_tx);

        let handle = std::thread::Builder::new()
            .name("lnlink-loop".into())
            .spawn(move || client_loop.run())?;
        session.thread = Some(handle);

        let outcome = match ready_rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectError::Closed),
        };
        match outcome {
            Ok(()) => Ok(session),
            Err(e) => {
                let _ = session.shutdown();
                Err(e)
            }
        }
    }

    /// Build a loop and its session without spawning a thread.
    ///
    /// The caller drives the loop with [`ClientLoop::turn`] or
    /// [`ClientLoop::run`].
    pub fn build_loop<T: Transport>(self, transport: T) -> io::Result<(ClientLoop<T>, Session)> {
        let (mux, waker) = Multiplexer::new()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let config = self.config;

        let session = Session {
            commands: commands_tx,
            waker: Arc::new(waker),
            next_ticket: AtomicU64::new(1),
            default_timeout: config.default_timeout,
            thread: None,
        };

        let client_loop = ClientLoop {
            transport,
            state: LoopState::Connecting,
            mux,
            inbound: InboundBuffer::with_max_frame_size(config.max_frame_size),
            correlator: Correlator::new(config.rune.clone(), config.max_reply_size),
            unsent: VecDeque::new(),
            outbound: BytesMut::new(),
            commands: commands_rx,
            read_buf: vec![0u8; config.read_chunk_size.max(1)],
            connect_deadline: Instant::now().checked_add(config.connect_timeout),
            connected: false,
            init_sent: false,
            ready_tx: None,
            config,
        };

        Ok((client_loop, session))
    }
}

/// Message from callers to the loop thread.
#[derive(Debug)]
enum Command {
    Submit {
        ticket: u64,
        method: String,
        params: Value,
        deadline: Option<Instant>,
        slot: Completion,
    },
    Cancel(u64),
    Shutdown,
}

/// Caller-side handle to a running session.
///
/// `Session` is `Sync`; several threads may have calls outstanding at once.
/// Dropping it asks the loop to drain and close.
#[derive(Debug)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
    next_ticket: AtomicU64,
    default_timeout: Duration,
    thread: Option<JoinHandle<Result<(), SessionError>>>,
}

impl Session {
    /// Queue a request and return a handle to its outcome.
    ///
    /// `timeout` of `None` uses the configured default.
    pub fn submit(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, CallError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now().checked_add(timeout.unwrap_or(self.default_timeout));
        let (slot, rx) = oneshot::channel();

        self.commands
            .send(Command::Submit {
                ticket,
                method: method.to_string(),
                params,
                deadline,
                slot,
            })
            .map_err(|_| CallError::ConnectionClosed)?;
        wake(&self.waker);

        Ok(PendingCall {
            ticket,
            rx,
            commands: self.commands.clone(),
            waker: self.waker.clone(),
        })
    }

    /// Submit and block until the outcome arrives.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`call_async`](Self::call_async) there.
    pub fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        self.submit(method, params, timeout)?.wait()
    }

    /// Submit and await the outcome.
    pub async fn call_async(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        self.submit(method, params, timeout)?.recv().await
    }

    /// Default deadline applied by [`submit`](Self::submit).
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Whether the loop has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Stop accepting requests, let in-flight ones finish, and wait for the
    /// loop to close.
    ///
    /// Returns the loop's terminal status. Sessions built with
    /// [`ClientBuilder::build_loop`] return as soon as the request is sent.
    pub fn shutdown(mut self) -> Result<(), SessionError> {
        let _ = self.commands.send(Command::Shutdown);
        wake(&self.waker);

        match self.thread.take() {
            Some(handle) => match handle.join() {
                Ok(status) => status,
                Err(_) => Err(SessionError::Io(io::Error::other("client loop panicked"))),
            },
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.commands.send(Command::Shutdown).is_ok() {
            wake(&self.waker);
        }
    }
}

fn wake(waker: &Waker) {
    if let Err(e) = waker.wake() {
        tracing::warn!("Failed to wake client loop: {}", e);
    }
}

/// Outcome of one submitted request.
#[derive(Debug)]
pub struct PendingCall {
    ticket: u64,
    rx: oneshot::Receiver<Result<Value, CallError>>,
    commands: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
}

impl PendingCall {
    /// Session-local handle used for cancellation.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Ask the loop to drop this request and complete it with
    /// [`CallError::Cancelled`]. Nothing is sent to the node.
    ///
    /// No effect if the request already completed.
    pub fn cancel(&self) {
        if self.commands.send(Command::Cancel(self.ticket)).is_ok() {
            wake(&self.waker);
        }
    }

    /// Block until the outcome arrives.
    ///
    /// Panics if called from inside an async runtime.
    pub fn wait(self) -> Result<Value, CallError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(CallError::ConnectionClosed),
        }
    }

    /// Await the outcome.
    pub async fn recv(self) -> Result<Value, CallError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CallError::ConnectionClosed),
        }
    }

    /// Return the outcome if it already arrived.
    pub fn try_result(&mut self) -> Option<Result<Value, CallError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CallError::ConnectionClosed)),
        }
    }
}

/// Lifecycle of a [`ClientLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Transport connect or `init` exchange in progress. Requests queue.
    Connecting,
    /// Requests are written as the socket accepts them.
    Ready,
    /// Shutdown requested. In-flight requests finish; new ones are refused.
    Draining,
    /// Terminal. Nothing is pending and the transport is released.
    Closed,
}

/// Single-threaded driver for one connection.
///
/// Owns the transport, the inbound buffer, and the request table. Every
/// call to [`turn`](Self::turn) performs one readiness wait and handles
/// whatever became actionable.
pub struct ClientLoop<T: Transport> {
    transport: T,
    state: LoopState,
    mux: Multiplexer,
    inbound: InboundBuffer,
    correlator: Correlator,
    /// Request ids submitted but not yet moved to `outbound`.
    unsent: VecDeque<u64>,
    /// Encoded bytes waiting for the socket.
    outbound: BytesMut,
    commands: mpsc::UnboundedReceiver<Command>,
    config: ClientConfig,
    read_buf: Vec<u8>,
    connect_deadline: Option<Instant>,
    /// Transport-level connect finished.
    connected: bool,
    init_sent: bool,
    ready_tx: Option<SyncSender<Result<(), ConnectError>>>,
}

impl<T: Transport> ClientLoop<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of requests not yet completed.
    pub fn pending(&self) -> usize {
        self.correlator.len()
    }

    /// Bytes queued for the socket.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Report the outcome of the connect phase on `tx`.
    pub fn notify_ready(&mut self, tx: SyncSender<Result<(), ConnectError>>) {
        self.ready_tx = Some(tx);
    }

    /// Drive the loop until it closes.
    pub fn run(mut self) -> Result<(), SessionError> {
        while self.state != LoopState::Closed {
            self.turn()?;
        }
        Ok(())
    }

    /// Run one iteration.
    ///
    /// On error the loop is already closed: every pending request was
    /// completed with [`CallError::ConnectionClosed`].
    pub fn turn(&mut self) -> Result<LoopState, SessionError> {
        if self.state == LoopState::Closed {
            return Ok(LoopState::Closed);
        }
        match self.step() {
            Ok(()) => Ok(self.state),
            Err(e) => {
                tracing::error!("Client loop error: {}", e);
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Err(connect_error_from(&e)));
                }
                self.close();
                Err(e)
            }
        }
    }

    fn step(&mut self) -> Result<(), SessionError> {
        self.drain_commands();
        self.advance(Instant::now())?;
        if self.state == LoopState::Closed {
            return Ok(());
        }

        let interest = self.interest();
        let timeout = self.next_timeout(Instant::now());
        let events = {
            let mut set = DescriptorSet::new();
            set.watch(SESSION, self.transport.as_fd(), interest);
            loop {
                match self.mux.wait(&set, timeout) {
                    Ok(events) => break events,
                    Err(MuxError::Interrupted) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if let Some(ready) = events.get(SESSION) {
            if !self.connected {
                self.poll_connect()?;
            } else {
                if ready.readable {
                    self.read_available()?;
                }
                if ready.writable {
                    self.flush()?;
                }
            }
        }

        self.correlator.on_timeout(Instant::now());
        Ok(())
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => return,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.begin_drain();
                    return;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                ticket,
                method,
                params,
                deadline,
                slot,
            } => {
                if matches!(self.state, LoopState::Draining | LoopState::Closed) {
                    let _ = slot.send(Err(CallError::Draining));
                    return;
                }
                match self.correlator.submit(ticket, &method, params, deadline, slot) {
                    Ok(id) => self.unsent.push_back(id),
                    Err(e) => tracing::warn!("Dropping {} request: {}", method, e),
                }
            }
            Command::Cancel(ticket) => {
                if let Some(id) = self.correlator.cancel_ticket(ticket) {
                    tracing::debug!("Cancelled request {} (ticket {})", id, ticket);
                }
            }
            Command::Shutdown => self.begin_drain(),
        }
    }

    fn begin_drain(&mut self) {
        match self.state {
            LoopState::Connecting => {
                tracing::debug!("Shutdown before session was ready");
                self.close();
            }
            LoopState::Ready => {
                tracing::debug!("Session draining ({} pending)", self.correlator.len());
                self.state = LoopState::Draining;
            }
            LoopState::Draining | LoopState::Closed => {}
        }
    }

    /// Apply state transitions that need no I/O readiness.
    fn advance(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.state {
            LoopState::Connecting => {
                if self.connect_deadline.is_some_and(|d| now >= d) {
                    return Err(ConnectError::Timeout.into());
                }
                if !self.connected {
                    self.poll_connect()?;
                }
                if self.connected && !self.init_sent {
                    self.outbound
                        .extend_from_slice(&build_frame(msg_type::INIT, None, &init_body()));
                    self.init_sent = true;
                }
            }
            LoopState::Ready | LoopState::Draining => {
                while let Some(id) = self.unsent.pop_front() {
                    if let Some(encoded) = self.correlator.take_unsent(id) {
                        self.outbound.extend_from_slice(&encoded);
                    }
                }
                if self.state == LoopState::Draining
                    && self.correlator.is_empty()
                    && self.outbound.is_empty()
                {
                    self.close();
                }
            }
            LoopState::Closed => {}
        }
        Ok(())
    }

    fn poll_connect(&mut self) -> Result<(), SessionError> {
        self.connected = self.transport.poll_connect().map_err(ConnectError::Io)?;
        if self.connected {
            tracing::debug!("Transport connected");
        }
        Ok(())
    }

    /// Readable always; writable while connecting or with bytes queued.
    fn interest(&self) -> Interest {
        if !self.connected || !self.outbound.is_empty() {
            Interest::BOTH
        } else {
            Interest::READABLE
        }
    }

    /// Time until the nearest deadline, `None` to wait indefinitely.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let connect = match self.state {
            LoopState::Connecting => self.connect_deadline,
            _ => None,
        };
        [connect, self.correlator.nearest_deadline()]
            .into_iter()
            .flatten()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Read until the socket is drained or the per-turn budget is spent.
    /// Leftover data keeps the descriptor readable for the next turn.
    fn read_available(&mut self) -> Result<(), SessionError> {
        for _ in 0..MAX_READS_PER_TURN {
            match self.transport.read(&mut self.read_buf)? {
                ReadOutcome::Data(n) => {
                    let frames = self.inbound.push(&self.read_buf[..n])?;
                    for frame in frames {
                        self.dispatch(frame)?;
                    }
                }
                ReadOutcome::WouldBlock => return Ok(()),
                ReadOutcome::Closed => return Err(SessionError::PeerClosed),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), SessionError> {
        match frame.msg_type {
            msg_type::INIT => self.on_peer_init(),
            msg_type::PING => {
                if let Some(pong) = pong_for(frame.payload()) {
                    self.outbound
                        .extend_from_slice(&build_frame(msg_type::PONG, None, &pong));
                }
            }
            msg_type::PONG => tracing::debug!("Received pong"),
            t if msg_type::is_reply(t) => match self.correlator.on_frame(&frame)? {
                Delivery::Partial(id) => tracing::debug!("Reply chunk for request {}", id),
                Delivery::Completed(_) | Delivery::Unmatched(_) => {}
            },
            t if msg_type::is_commando(t) => {
                tracing::warn!("Ignoring commando command {:#06x} from peer", t)
            }
            t => tracing::debug!("Ignoring message type {}", t),
        }
        Ok(())
    }

    fn on_peer_init(&mut self) {
        if self.state != LoopState::Connecting {
            tracing::debug!("Ignoring repeated init");
            return;
        }
        tracing::debug!("Session ready");
        self.state = LoopState::Ready;
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn flush(&mut self) -> Result<(), SessionError> {
        while !self.outbound.is_empty() {
            match self.transport.write(&self.outbound)? {
                WriteOutcome::Written(n) => self.outbound.advance(n),
                WriteOutcome::WouldBlock => break,
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.state == LoopState::Closed {
            return;
        }
        let failed = self.correlator.fail_all(CallError::ConnectionClosed);
        if failed > 0 {
            tracing::debug!("Failed {} pending requests on close", failed);
        }
        self.unsent.clear();
        self.outbound.clear();
        self.transport.close();
        self.state = LoopState::Closed;
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Err(ConnectError::Closed));
        }
        tracing::debug!("Session closed");
    }
}

impl<T: Transport> Drop for ClientLoop<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy a loop failure into the error reported to `connect`.
fn connect_error_from(err: &SessionError) -> ConnectError {
    fn copy_io(e: &io::Error) -> io::Error {
        io::Error::new(e.kind(), e.to_string())
    }

    match err {
        SessionError::Connect(ConnectError::InvalidAddress(s)) => {
            ConnectError::InvalidAddress(s.clone())
        }
        SessionError::Connect(ConnectError::Resolve { host, source }) => ConnectError::Resolve {
            host: host.clone(),
            source: copy_io(source),
        },
        SessionError::Connect(ConnectError::Io(e)) | SessionError::Io(e) => {
            ConnectError::Io(copy_io(e))
        }
        SessionError::Connect(ConnectError::Handshake(s)) => ConnectError::Handshake(s.clone()),
        SessionError::Connect(ConnectError::Timeout) => ConnectError::Timeout,
        SessionError::Connect(ConnectError::Closed) | SessionError::PeerClosed => {
            ConnectError::Closed
        }
        SessionError::Protocol(e) => ConnectError::Handshake(e.to_string()),
        SessionError::Mux(e) => ConnectError::Io(io::Error::other(e.to_string())),
    }
}
