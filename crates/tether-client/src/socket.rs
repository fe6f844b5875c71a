//! The socket: one connection shared by many channels.
//!
//! All state lives in a [`SocketActor`] running on its own tokio task.
//! [`Socket`] and the other handles only enqueue [`Command`]s, so transport
//! events, timer expiries and API calls are applied one at a time in arrival
//! order.
//!
//! The actor stops once every handle is dropped. Timers and transport event
//! sinks only hold weak senders and never keep it alive.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tether_protocol::{
    decode, encode, endpoint_url, EndpointError, Frame, Message, RefCounter, Version, PROTOCOL_VERSION,
};
use tether_transport::{
    CloseEvent, ConnectOptions, Connector, EventSink, ReadyState, Transport, TransportEvent,
    CLOSE_NORMAL,
};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelCommand, ChannelId, ChannelTable};
use crate::lifecycle::{LifecycleEvent, LifecycleSignal};
use crate::metrics;
use crate::options::{Params, SocketOptions};
use crate::timer::{RetryTimer, TimerKey, Timers};

const TEARDOWN_STEP: Duration = Duration::from_millis(150);
const TEARDOWN_TRIES: u32 = 5;
const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Socket errors.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] EndpointError),

    #[error("socket is not connected")]
    NotConnected,

    /// The socket task stopped.
    #[error("socket task terminated")]
    Terminated,

    #[error("no tokio runtime available to run the socket")]
    NoRuntime,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

/// Handle returned when registering a socket callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef(u64);

/// Passed to error callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// What the transport reported.
    pub error: String,
    /// Name of the transport that failed.
    pub transport: &'static str,
    /// Connections opened by this socket so far.
    pub established_connections: u64,
}

type OpenCallback = Box<dyn FnMut() + Send>;
type CloseCallback = Box<dyn FnMut(&CloseEvent) + Send>;
type ErrorCallback = Box<dyn FnMut(&ErrorEvent) + Send>;
type MessageCallback = Box<dyn FnMut(&Message) + Send>;

pub(crate) enum StateCallback {
    Open(OpenCallback),
    Close(CloseCallback),
    Error(ErrorCallback),
    Message(MessageCallback),
}

#[derive(Default)]
struct StateCallbacks {
    open: Vec<(CallbackRef, OpenCallback)>,
    close: Vec<(CallbackRef, CloseCallback)>,
    error: Vec<(CallbackRef, ErrorCallback)>,
    message: Vec<(CallbackRef, MessageCallback)>,
}

impl StateCallbacks {
    fn add(&mut self, reference: CallbackRef, callback: StateCallback) {
        match callback {
            StateCallback::Open(cb) => self.open.push((reference, cb)),
            StateCallback::Close(cb) => self.close.push((reference, cb)),
            StateCallback::Error(cb) => self.error.push((reference, cb)),
            StateCallback::Message(cb) => self.message.push((reference, cb)),
        }
    }

    fn remove(&mut self, refs: &[CallbackRef]) {
        self.open.retain(|(r, _)| !refs.contains(r));
        self.close.retain(|(r, _)| !refs.contains(r));
        self.error.retain(|(r, _)| !refs.contains(r));
        self.message.retain(|(r, _)| !refs.contains(r));
    }
}

pub(crate) type Inspector = Box<dyn FnOnce(&mut SocketActor) + Send>;

/// Everything the actor reacts to.
pub(crate) enum Command {
    Connect,
    Disconnect {
        code: Option<u16>,
        reason: Option<String>,
        done: oneshot::Sender<()>,
    },
    ReplaceTransport(Arc<dyn Connector>),
    Push(Message),
    On(CallbackRef, StateCallback),
    Off(Vec<CallbackRef>),
    Ping(oneshot::Sender<Result<Duration, SocketError>>),
    Inspect(Inspector),
    Transport {
        conn: u64,
        event: TransportEvent,
    },
    Timer {
        key: TimerKey,
        generation: u64,
    },
    Lifecycle(LifecycleEvent),
    Release(ChannelId),
    Channel(ChannelId, ChannelCommand),
}

/// Id source shared by handles and the actor.
#[derive(Debug, Default)]
pub(crate) struct Ids(AtomicU64);

impl Ids {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub(crate) struct SocketShared {
    tx: UnboundedSender<Command>,
    ids: Arc<Ids>,
    endpoint: String,
}

impl SocketShared {
    pub(crate) fn next_id(&self) -> u64 {
        self.ids.next()
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), SocketError> {
        self.tx.send(command).map_err(|_| SocketError::Terminated)
    }

    /// Enqueue a command whose outcome nobody waits for.
    pub(crate) fn send_quiet(&self, command: Command) {
        let _ = self.tx.send(command);
    }

    /// Run `f` on the actor and return its result.
    pub(crate) async fn inspect<T, F>(&self, f: F) -> Result<T, SocketError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SocketActor) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Inspect(Box::new(move |actor| {
            let _ = tx.send(f(actor));
        })))?;
        rx.await.map_err(|_| SocketError::Terminated)
    }
}

/// Handle to a socket.
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    /// Create a socket for `endpoint` (for example `wss://example.com/socket`)
    /// and start its task on the current tokio runtime.
    ///
    /// The socket does not connect until [`connect`](Self::connect) is called.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::InvalidEndpoint`] if the endpoint cannot be
    /// resolved, [`SocketError::UnsupportedVersion`] if `vsn` is not a 2.x
    /// version and [`SocketError::NoRuntime`] outside a tokio runtime.
    pub fn new(endpoint: impl Into<String>, mut options: SocketOptions) -> Result<Self, SocketError> {
        let endpoint = endpoint.into();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SocketError::NoRuntime)?;
        let vsn: Version = options.vsn.parse().map_err(SocketError::UnsupportedVersion)?;
        if !vsn.is_compatible_with(&PROTOCOL_VERSION) {
            return Err(SocketError::UnsupportedVersion(vsn.to_string()));
        }
        endpoint_url(
            &endpoint,
            options.connector.endpoint_suffix(),
            &Value::Object(Map::new()),
            &options.vsn,
            &options.page,
        )?;

        let (tx, rx) = mpsc::unbounded_channel();
        let ids = Arc::new(Ids::default());
        let lifecycle = options.lifecycle.take();
        let actor = SocketActor::new(endpoint.clone(), options, ids.clone(), tx.downgrade());

        if let Some(signal) = lifecycle {
            runtime.spawn(forward_lifecycle(signal, tx.downgrade()));
        }
        runtime.spawn(actor.run(rx));

        Ok(Self {
            shared: Arc::new(SocketShared { tx, ids, endpoint }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<SocketShared>) -> Self {
        Self { shared }
    }

    /// The endpoint the socket was created with.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Open the connection. Does nothing if a transport already exists.
    pub fn connect(&self) {
        self.shared.send_quiet(Command::Connect);
    }

    /// Close the connection without reconnecting.
    ///
    /// Waits for buffered data to drain and the transport to close.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Terminated`] if the socket task is gone.
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<&str>) -> Result<(), SocketError> {
        let (done, rx) = oneshot::channel();
        self.shared.send(Command::Disconnect {
            code,
            reason: reason.map(str::to_string),
            done,
        })?;
        rx.await.map_err(|_| SocketError::Terminated)
    }

    /// Send a raw message, buffering it while disconnected.
    pub fn push(&self, message: Message) {
        self.shared.send_quiet(Command::Push(message));
    }

    /// Create a channel for `topic`.
    pub fn channel(&self, topic: impl Into<String>, params: impl Into<Params>) -> Channel {
        Channel::create(self.shared.clone(), topic.into(), params.into())
    }

    fn on(&self, callback: StateCallback) -> CallbackRef {
        let reference = CallbackRef(self.shared.next_id());
        self.shared.send_quiet(Command::On(reference, callback));
        reference
    }

    /// Called each time the connection opens.
    pub fn on_open(&self, callback: impl FnMut() + Send + 'static) -> CallbackRef {
        self.on(StateCallback::Open(Box::new(callback)))
    }

    /// Called each time the connection closes.
    pub fn on_close(&self, callback: impl FnMut(&CloseEvent) + Send + 'static) -> CallbackRef {
        self.on(StateCallback::Close(Box::new(callback)))
    }

    /// Called on transport errors.
    pub fn on_error(&self, callback: impl FnMut(&ErrorEvent) + Send + 'static) -> CallbackRef {
        self.on(StateCallback::Error(Box::new(callback)))
    }

    /// Called with every decoded message, after channels saw it.
    pub fn on_message(&self, callback: impl FnMut(&Message) + Send + 'static) -> CallbackRef {
        self.on(StateCallback::Message(Box::new(callback)))
    }

    /// Remove callbacks.
    pub fn off(&self, refs: &[CallbackRef]) {
        self.shared.send_quiet(Command::Off(refs.to_vec()));
    }

    /// Measure a heartbeat round trip.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotConnected`] if the socket is not connected
    /// or the connection closes before the reply.
    pub async fn ping(&self) -> Result<Duration, SocketError> {
        let (tx, rx) = oneshot::channel();
        self.shared.send(Command::Ping(tx))?;
        rx.await.unwrap_or(Err(SocketError::NotConnected))
    }

    /// Drop the current transport and use `connector` from the next connect.
    pub fn replace_transport(&self, connector: Arc<dyn Connector>) {
        self.shared.send_quiet(Command::ReplaceTransport(connector));
    }

    /// Ready state of the current transport, `Closed` without one.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Terminated`] if the socket task is gone.
    pub async fn connection_state(&self) -> Result<ReadyState, SocketError> {
        self.shared.inspect(|actor| actor.connection_state()).await
    }

    /// Whether the transport is open.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Terminated`] if the socket task is gone.
    pub async fn is_connected(&self) -> Result<bool, SocketError> {
        self.shared.inspect(|actor| actor.is_connected()).await
    }

    /// Number of channels registered on the socket.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Terminated`] if the socket task is gone.
    pub async fn channel_count(&self) -> Result<usize, SocketError> {
        self.shared.inspect(|actor| actor.channels.len()).await
    }

    /// The URL the next connect would use. Evaluates the params.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::InvalidEndpoint`] if the URL cannot be built.
    pub async fn endpoint_url(&self) -> Result<String, SocketError> {
        self.shared
            .inspect(|actor| actor.endpoint_url())
            .await?
            .map_err(SocketError::from)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SocketShared> {
        &self.shared
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint", &self.shared.endpoint)
            .finish()
    }
}

async fn forward_lifecycle(mut signal: LifecycleSignal, tx: WeakUnboundedSender<Command>) {
    while let Some(event) = signal.recv().await {
        let Some(tx) = tx.upgrade() else {
            break;
        };
        if tx.send(Command::Lifecycle(event)).is_err() {
            break;
        }
    }
}

struct Connection {
    id: u64,
    url: String,
    transport: Box<dyn Transport>,
    close_seen: bool,
}

/// What runs once a teardown completes.
enum Continuation {
    Connect,
    ScheduleReconnect,
    Notify(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownStage {
    /// Waiting for buffered bytes to be written.
    Drain,
    /// Close requested, waiting for the transport to report it.
    Closing,
}

struct Teardown {
    stage: TeardownStage,
    tries: u32,
    code: Option<u16>,
    reason: Option<String>,
    continuations: Vec<Continuation>,
}

pub(crate) struct SocketActor {
    pub(crate) options: SocketOptions,
    pub(crate) ids: Arc<Ids>,
    pub(crate) refs: RefCounter,
    pub(crate) timers: Timers,
    pub(crate) channels: ChannelTable,
    endpoint: String,
    tx: WeakUnboundedSender<Command>,
    conn: Option<Connection>,
    conn_seq: u64,
    connect_clock: u64,
    close_was_clean: bool,
    established_connections: u64,
    send_buffer: VecDeque<Message>,
    pending_heartbeat: Option<String>,
    pings: HashMap<String, (Instant, oneshot::Sender<Result<Duration, SocketError>>)>,
    reconnect: RetryTimer,
    teardown: Option<Teardown>,
    callbacks: StateCallbacks,
    hidden_at: Option<u64>,
}

impl SocketActor {
    fn new(
        endpoint: String,
        options: SocketOptions,
        ids: Arc<Ids>,
        tx: WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            options,
            ids,
            refs: RefCounter::new(),
            timers: Timers::new(tx.clone()),
            channels: ChannelTable::default(),
            endpoint,
            tx,
            conn: None,
            conn_seq: 0,
            connect_clock: 0,
            close_was_clean: false,
            established_connections: 0,
            send_buffer: VecDeque::new(),
            pending_heartbeat: None,
            pings: HashMap::new(),
            reconnect: RetryTimer::new(TimerKey::Reconnect),
            teardown: None,
            callbacks: StateCallbacks::default(),
            hidden_at: None,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        debug!(endpoint = %self.endpoint, "socket task started");
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!(endpoint = %self.endpoint, "socket task stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect { code, reason, done } => self.disconnect(code, reason, Some(done)),
            Command::ReplaceTransport(connector) => self.replace_transport(connector),
            Command::Push(message) => self.push(message),
            Command::On(reference, callback) => self.callbacks.add(reference, callback),
            Command::Off(refs) => self.callbacks.remove(&refs),
            Command::Ping(reply) => self.ping(reply),
            Command::Inspect(f) => f(self),
            Command::Transport { conn, event } => self.on_transport_event(conn, event),
            Command::Timer { key, generation } => {
                if self.timers.fire(key, generation) {
                    self.on_timer(key);
                }
            }
            Command::Lifecycle(event) => self.on_lifecycle(event),
            Command::Release(id) => self.release_channel(id),
            Command::Channel(id, command) => self.handle_channel(id, command),
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Reconnect => {
                self.reconnect.fired();
                metrics::record_reconnect();
                debug!("reconnecting");
                self.teardown(Some(Continuation::Connect), None, None);
            }
            TimerKey::Heartbeat => self.send_heartbeat(),
            TimerKey::HeartbeatTimeout => self.heartbeat_timeout(),
            TimerKey::Teardown => self.advance_teardown(),
            TimerKey::Rejoin(id) => self.on_rejoin_timer(id),
            TimerKey::PushTimeout(channel, push) => self.on_push_timeout(channel, push),
        }
    }

    pub(crate) fn connection_state(&self) -> ReadyState {
        self.conn
            .as_ref()
            .map_or(ReadyState::Closed, |c| c.transport.ready_state())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection_state() == ReadyState::Open
    }

    fn transport_name(&self) -> &'static str {
        self.conn
            .as_ref()
            .map_or(self.options.connector.name(), |c| c.transport.name())
    }

    pub(crate) fn endpoint_url(&self) -> Result<String, EndpointError> {
        endpoint_url(
            &self.endpoint,
            self.options.connector.endpoint_suffix(),
            &self.options.params.value(),
            &self.options.vsn,
            &self.options.page,
        )
    }

    fn connect(&mut self) {
        if self.conn.is_some() {
            return;
        }
        self.connect_clock += 1;
        self.close_was_clean = false;

        let url = match self.endpoint_url() {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "cannot build endpoint url");
                return;
            }
        };

        self.conn_seq += 1;
        let conn = self.conn_seq;
        let tx = self.tx.clone();
        let events = EventSink::new(move |event| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Transport { conn, event });
            }
        });
        let options = ConnectOptions {
            long_poll_timeout: self.options.long_poll_timeout,
        };

        info!(conn, url = %url, transport = self.options.connector.name(), "connecting");
        let transport = self.options.connector.connect(&url, &options, events);
        self.conn = Some(Connection {
            id: conn,
            url,
            transport,
            close_seen: false,
        });
    }

    fn disconnect(&mut self, code: Option<u16>, reason: Option<String>, done: Option<oneshot::Sender<()>>) {
        self.connect_clock += 1;
        self.close_was_clean = true;
        self.reconnect.reset(&mut self.timers);
        if let Some(teardown) = &mut self.teardown {
            teardown
                .continuations
                .retain(|c| matches!(c, Continuation::Notify(_)));
        }
        info!(code = ?code, reason = reason.as_deref().unwrap_or(""), "disconnecting");
        self.teardown(done.map(Continuation::Notify), code, reason);
    }

    fn replace_transport(&mut self, connector: Arc<dyn Connector>) {
        self.connect_clock += 1;
        self.close_was_clean = true;
        self.reconnect.reset(&mut self.timers);
        self.send_buffer.clear();
        debug!(transport = connector.name(), "replacing transport");

        if let Some(mut conn) = self.conn.take() {
            conn.transport.close(None, None);
            if !conn.close_seen {
                self.on_conn_close(CloseEvent::new(CLOSE_NORMAL, "", true));
            }
        }
        if self.teardown.is_some() {
            self.finish_teardown();
        }
        self.options.connector = connector;
    }

    /// Close the transport in stages, then run `continuation`.
    ///
    /// Without a transport the continuation runs right away. A teardown
    /// already in progress keeps its code and takes the continuation.
    fn teardown(&mut self, continuation: Option<Continuation>, code: Option<u16>, reason: Option<String>) {
        if self.conn.is_none() {
            if let Some(continuation) = continuation {
                self.run_continuation(continuation);
            }
            return;
        }
        if let Some(teardown) = &mut self.teardown {
            teardown.continuations.extend(continuation);
            return;
        }
        self.teardown = Some(Teardown {
            stage: TeardownStage::Drain,
            tries: 1,
            code,
            reason,
            continuations: continuation.into_iter().collect(),
        });
        self.advance_teardown();
    }

    fn advance_teardown(&mut self) {
        let Some(teardown) = &mut self.teardown else {
            return;
        };

        if teardown.stage == TeardownStage::Drain {
            let drained = self
                .conn
                .as_ref()
                .map_or(true, |c| c.transport.buffered_amount() == 0);
            if !drained && teardown.tries < TEARDOWN_TRIES {
                self.timers
                    .schedule(TimerKey::Teardown, TEARDOWN_STEP * teardown.tries);
                teardown.tries += 1;
                return;
            }
            if let Some(conn) = &mut self.conn {
                trace!(conn = conn.id, "closing transport");
                conn.transport.close(teardown.code, teardown.reason.as_deref());
            }
            teardown.stage = TeardownStage::Closing;
            teardown.tries = 1;
        }

        let closed = self.conn.as_ref().map_or(true, |c| {
            c.close_seen && c.transport.ready_state() == ReadyState::Closed
        });
        if !closed && teardown.tries < TEARDOWN_TRIES {
            self.timers
                .schedule(TimerKey::Teardown, TEARDOWN_STEP * teardown.tries);
            teardown.tries += 1;
            return;
        }
        self.finish_teardown();
    }

    fn finish_teardown(&mut self) {
        self.timers.cancel(TimerKey::Teardown);
        if let Some(conn) = self.conn.take() {
            debug!(conn = conn.id, "transport torn down");
        }
        let Some(teardown) = self.teardown.take() else {
            return;
        };
        for continuation in teardown.continuations {
            self.run_continuation(continuation);
        }
    }

    fn run_continuation(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::Connect => self.connect(),
            Continuation::ScheduleReconnect => self
                .reconnect
                .schedule(&mut self.timers, &self.options.reconnect_after),
            Continuation::Notify(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Send now when connected, otherwise buffer until the next open.
    pub(crate) fn push(&mut self, message: Message) {
        trace!(
            topic = %message.topic,
            event = %message.event,
            reference = ?message.reference,
            join_ref = ?message.join_ref,
            "push"
        );
        if self.options.logger.is_some() {
            let msg = format!(
                "{} {} ({}, {})",
                message.topic,
                message.event,
                message.join_ref.as_deref().unwrap_or(""),
                message.reference.as_deref().unwrap_or("")
            );
            self.options.log("push", &msg, message.payload.as_json());
        }

        if self.is_connected() {
            self.send_now(&message);
        } else {
            self.send_buffer.push_back(message);
        }
    }

    fn send_now(&mut self, message: &Message) {
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic = %message.topic, event = %message.event, error = %e, "dropping unencodable message");
                return;
            }
        };
        let Some(conn) = &mut self.conn else {
            return;
        };
        metrics::record_message(frame.len(), "outbound");
        if let Err(e) = conn.transport.send(frame) {
            warn!(conn = conn.id, error = %e, "send failed");
        }
    }

    fn flush_send_buffer(&mut self) {
        if !self.is_connected() {
            return;
        }
        while let Some(message) = self.send_buffer.pop_front() {
            self.send_now(&message);
        }
    }

    fn ping(&mut self, reply: oneshot::Sender<Result<Duration, SocketError>>) {
        if !self.is_connected() {
            let _ = reply.send(Err(SocketError::NotConnected));
            return;
        }
        let reference = self.refs.next_ref();
        self.pings
            .insert(reference.clone(), (Instant::now(), reply));
        self.push(Message::heartbeat(reference));
    }

    fn clear_heartbeats(&mut self) {
        self.timers.cancel(TimerKey::Heartbeat);
        self.timers.cancel(TimerKey::HeartbeatTimeout);
    }

    fn reset_heartbeat(&mut self) {
        if self
            .conn
            .as_ref()
            .is_some_and(|c| c.transport.skip_heartbeat())
        {
            return;
        }
        self.pending_heartbeat = None;
        self.clear_heartbeats();
        self.timers
            .schedule(TimerKey::Heartbeat, self.options.heartbeat_interval);
    }

    fn send_heartbeat(&mut self) {
        if self.pending_heartbeat.is_some() && !self.is_connected() {
            return;
        }
        let reference = self.refs.next_ref();
        trace!(reference = %reference, "heartbeat");
        self.pending_heartbeat = Some(reference.clone());
        self.push(Message::heartbeat(reference));
        self.timers
            .schedule(TimerKey::HeartbeatTimeout, self.options.heartbeat_interval);
    }

    fn heartbeat_timeout(&mut self) {
        let Some(reference) = self.pending_heartbeat.take() else {
            return;
        };
        warn!(reference = %reference, "heartbeat timeout, re-establishing connection");
        metrics::record_heartbeat_timeout();
        self.options.log(
            "transport",
            "heartbeat timeout. Attempting to re-establish connection",
            None,
        );
        self.trigger_chan_error();
        self.close_was_clean = false;
        self.teardown(
            Some(Continuation::ScheduleReconnect),
            Some(self.options.heartbeat_close_code),
            Some(HEARTBEAT_TIMEOUT_REASON.to_string()),
        );
    }

    fn on_transport_event(&mut self, conn: u64, event: TransportEvent) {
        if self.conn.as_ref().map(|c| c.id) != Some(conn) {
            trace!(conn, "ignoring event from a previous connection");
            return;
        }
        match event {
            TransportEvent::Open => self.on_conn_open(),
            TransportEvent::Error(error) => self.on_conn_error(error),
            TransportEvent::Message(frame) => self.on_conn_message(frame),
            TransportEvent::Close(event) => {
                if let Some(conn) = &mut self.conn {
                    conn.close_seen = true;
                }
                self.on_conn_close(event);
                if self
                    .teardown
                    .as_ref()
                    .is_some_and(|t| t.stage == TeardownStage::Closing)
                {
                    self.advance_teardown();
                }
            }
        }
    }

    fn on_conn_open(&mut self) {
        let transport = self.transport_name();
        if let Some(conn) = &self.conn {
            info!(conn = conn.id, transport, "connected");
            self.options
                .log("transport", &format!("connected to {}", conn.url), None);
        }
        self.established_connections += 1;
        self.close_was_clean = false;
        metrics::record_connection(transport);

        self.flush_send_buffer();
        self.reconnect.reset(&mut self.timers);
        self.reset_heartbeat();
        self.channels_on_open();

        let mut callbacks = std::mem::take(&mut self.callbacks.open);
        for (_, callback) in &mut callbacks {
            callback();
        }
        self.callbacks.open = callbacks;
    }

    fn on_conn_error(&mut self, error: String) {
        warn!(error = %error, "transport error");
        self.options
            .log("transport", &error, None);
        let event = ErrorEvent {
            error,
            transport: self.transport_name(),
            established_connections: self.established_connections,
        };

        self.channels_on_error();
        let mut callbacks = std::mem::take(&mut self.callbacks.error);
        for (_, callback) in &mut callbacks {
            callback(&event);
        }
        self.callbacks.error = callbacks;

        self.trigger_chan_error();
    }

    fn on_conn_close(&mut self, event: CloseEvent) {
        info!(code = event.code, reason = %event.reason, was_clean = event.was_clean, "connection closed");
        if self.options.logger.is_some() {
            let data = json!({
                "code": event.code,
                "reason": event.reason,
                "was_clean": event.was_clean,
            });
            self.options.log("transport", "close", Some(&data));
        }

        self.trigger_chan_error();
        self.clear_heartbeats();
        self.pings.clear();
        if !self.close_was_clean && event.code != CLOSE_NORMAL {
            self.reconnect
                .schedule(&mut self.timers, &self.options.reconnect_after);
        }

        let mut callbacks = std::mem::take(&mut self.callbacks.close);
        for (_, callback) in &mut callbacks {
            callback(&event);
        }
        self.callbacks.close = callbacks;
    }

    fn on_conn_message(&mut self, frame: Frame) {
        metrics::record_message(frame.len(), "inbound");
        let message = match decode(frame) {
            Ok(message) => message,
            Err(e) => {
                metrics::record_decode_error();
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        trace!(
            topic = %message.topic,
            event = %message.event,
            reference = ?message.reference,
            join_ref = ?message.join_ref,
            "receive"
        );
        if self.options.logger.is_some() {
            let msg = format!(
                "{} {} {} {}",
                message.payload.status().unwrap_or(""),
                message.topic,
                message.event,
                message
                    .reference
                    .as_deref()
                    .map(|r| format!("({r})"))
                    .unwrap_or_default()
            );
            self.options.log("receive", &msg, message.payload.as_json());
        }

        if let Some(reference) = &message.reference {
            if self.pending_heartbeat.as_ref() == Some(reference) {
                self.clear_heartbeats();
                self.pending_heartbeat = None;
                self.timers
                    .schedule(TimerKey::Heartbeat, self.options.heartbeat_interval);
            }
            if let Some((started, reply)) = self.pings.remove(reference) {
                let _ = reply.send(Ok(started.elapsed()));
            }
        }

        for id in self.channels.active_ids() {
            if self.is_member(
                id,
                &message.topic,
                &message.event,
                &message.payload,
                message.join_ref.as_deref(),
            ) {
                self.trigger(
                    id,
                    &message.event,
                    message.payload.clone(),
                    message.reference.as_deref(),
                    message.join_ref.as_deref(),
                );
            }
        }

        let mut callbacks = std::mem::take(&mut self.callbacks.message);
        for (_, callback) in &mut callbacks {
            callback(&message);
        }
        self.callbacks.message = callbacks;
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Hidden => {
                if self.conn.is_some() {
                    debug!("page hidden, disconnecting");
                    self.disconnect(None, None, None);
                    self.hidden_at = Some(self.connect_clock);
                }
            }
            LifecycleEvent::Visible => {
                if self.hidden_at.is_some() && self.hidden_at == Some(self.connect_clock) {
                    debug!("page visible, reconnecting");
                    self.hidden_at = None;
                    match &mut self.teardown {
                        Some(teardown) => teardown.continuations.push(Continuation::Connect),
                        None => self.connect(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{joined_channel, memory_options, memory_socket, settle, MemorySetup, ENDPOINT};
    use crate::ChannelState;
    use std::sync::Mutex;
    use tether_protocol::Reply;
    use tether_transport::memory::MemoryConnector;

    fn counter() -> (Arc<Mutex<u32>>, impl FnMut() + Send + 'static) {
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        (count, move || *sink.lock().unwrap() += 1)
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_rejected() {
        let result = Socket::new("/socket", SocketOptions::default());
        assert!(matches!(result, Err(SocketError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_vsn_must_be_version_two() {
        let connector = MemoryConnector::new();
        let old = Socket::new(ENDPOINT, memory_options(&connector).with_vsn("1.0.0"));
        assert!(matches!(old, Err(SocketError::UnsupportedVersion(v)) if v == "1.0.0"));

        let garbage = Socket::new(ENDPOINT, memory_options(&connector).with_vsn("latest"));
        assert!(matches!(garbage, Err(SocketError::UnsupportedVersion(_))));

        let minor = Socket::new(ENDPOINT, memory_options(&connector).with_vsn("2.1.0")).unwrap();
        assert!(minor.endpoint_url().await.unwrap().ends_with("vsn=2.1.0"));
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = Socket::new("ws://localhost/socket", SocketOptions::default());
        assert!(matches!(result, Err(SocketError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_url_includes_params_and_vsn() {
        let connector = MemoryConnector::new();
        let options = memory_options(&connector).with_params(serde_json::json!({"token": "abc"}));
        let socket = Socket::new("ws://example.com/socket", options).unwrap();

        assert_eq!(
            socket.endpoint_url().await.unwrap(),
            "ws://example.com/socket/websocket?token=abc&vsn=2.0.0"
        );
        socket.connect();
        settle(&socket).await;
        assert_eq!(
            connector.last().unwrap().url(),
            "ws://example.com/socket/websocket?token=abc&vsn=2.0.0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_buffer_until_open() {
        let connector = MemoryConnector::new();
        let socket = memory_socket(&connector);

        let first = Message::new("room:1", "a", serde_json::json!({"n": 1}));
        let second = Message::new("room:1", "b", serde_json::json!({"n": 2}));
        socket.push(first.clone());
        socket.push(second.clone());
        socket.connect();
        settle(&socket).await;

        let server = connector.last().unwrap();
        assert!(server.sent().is_empty());
        assert_eq!(socket.connection_state().await.unwrap(), ReadyState::Connecting);

        server.open();
        settle(&socket).await;
        assert_eq!(server.sent(), vec![first, second]);
        assert!(socket.is_connected().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let setup = MemorySetup::connected().await;
        setup.socket.connect();
        settle(&setup.socket).await;
        assert_eq!(setup.connector.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_forces_reconnect() {
        let connector = MemoryConnector::new().auto_open();
        let options = memory_options(&connector).with_heartbeat_interval(Duration::from_millis(1000));
        let socket = Socket::new("ws://test/socket", options).unwrap();
        socket.connect();
        settle(&socket).await;
        let server = connector.last().unwrap();

        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle(&socket).await;
        let sent = server.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "phoenix");
        assert_eq!(sent[0].event, "heartbeat");

        tokio::time::sleep(Duration::from_millis(1000)).await;
        settle(&socket).await;
        assert_eq!(
            server.closed_with(),
            Some((Some(1000), Some("heartbeat timeout".to_string())))
        );
        assert_eq!(connector.connection_count(), 1);

        tokio::time::sleep(Duration::from_millis(11)).await;
        settle(&socket).await;
        assert_eq!(connector.connection_count(), 2);
        assert!(socket.is_connected().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_with_custom_close_code() {
        let connector = MemoryConnector::new().auto_open();
        let options = memory_options(&connector)
            .with_heartbeat_interval(Duration::from_millis(1000))
            .with_heartbeat_close_code(4000);
        let socket = Socket::new(ENDPOINT, options).unwrap();
        let codes = Arc::new(Mutex::new(Vec::new()));
        let seen = codes.clone();
        socket.on_close(move |event| seen.lock().unwrap().push(event.code));
        socket.connect();
        settle(&socket).await;
        let server = connector.last().unwrap();

        tokio::time::sleep(Duration::from_millis(2001)).await;
        settle(&socket).await;
        assert_eq!(
            server.closed_with(),
            Some((Some(4000), Some("heartbeat timeout".to_string())))
        );
        assert_eq!(*codes.lock().unwrap(), vec![4000]);

        tokio::time::sleep(Duration::from_millis(11)).await;
        settle(&socket).await;
        assert_eq!(connector.connection_count(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle(&socket).await;
        assert_eq!(connector.connection_count(), 2);
        assert!(socket.is_connected().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reply_schedules_next() {
        let connector = MemoryConnector::new().auto_open();
        let options = memory_options(&connector).with_heartbeat_interval(Duration::from_millis(1000));
        let socket = Socket::new("ws://test/socket", options).unwrap();
        socket.connect();
        settle(&socket).await;
        let server = connector.last().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1001)).await;
            settle(&socket).await;
            let heartbeat = server.take_sent().remove(0);
            server.reply(&heartbeat, Reply::new("ok", serde_json::json!({})));
            settle(&socket).await;
        }
        assert_eq!(server.closed_with(), None);
        assert_eq!(connector.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_heartbeat_transport() {
        let connector = MemoryConnector::new().auto_open().skipping_heartbeat();
        let socket = memory_socket(&connector);
        socket.connect();
        settle(&socket).await;

        tokio::time::sleep(Duration::from_secs(90)).await;
        settle(&socket).await;
        assert!(connector.last().unwrap().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclean_close_reconnects_and_rejoins() {
        let setup = MemorySetup::connected().await;
        let channel = joined_channel(&setup, "room:1").await;
        let (closes, mut on_close) = counter();
        setup.socket.on_close(move |_| on_close());

        setup.server.close(1006, "gone", false);
        settle(&setup.socket).await;
        assert_eq!(channel.state().await.unwrap(), ChannelState::Errored);
        assert_eq!(*closes.lock().unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(11)).await;
        settle(&setup.socket).await;
        assert_eq!(setup.connector.connection_count(), 2);

        let server = setup.connector.last().unwrap();
        let sent = server.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, "phx_join");
        assert_eq!(channel.state().await.unwrap(), ChannelState::Joining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_does_not_reconnect() {
        let setup = MemorySetup::connected().await;
        setup.server.close(1000, "bye", true);
        settle(&setup.socket).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&setup.socket).await;
        assert_eq!(setup.connector.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_clean_and_final() {
        let setup = MemorySetup::connected().await;
        setup
            .socket
            .disconnect(Some(4000), Some("done"))
            .await
            .unwrap();

        assert_eq!(
            setup.server.closed_with(),
            Some((Some(4000), Some("done".to_string())))
        );
        assert_eq!(
            setup.socket.connection_state().await.unwrap(),
            ReadyState::Closed
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&setup.socket).await;
        assert_eq!(setup.connector.connection_count(), 1);

        setup.socket.connect();
        settle(&setup.socket).await;
        assert_eq!(setup.connector.connection_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_connection_resolves() {
        let connector = MemoryConnector::new();
        let socket = memory_socket(&connector);
        socket.disconnect(None, None).await.unwrap();
        assert_eq!(connector.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_waits_for_buffer_to_drain() {
        let setup = MemorySetup::connected().await;
        setup.server.set_buffered_amount(64);

        let socket = setup.socket.clone();
        let disconnect = tokio::spawn(async move { socket.disconnect(None, None).await });
        settle(&setup.socket).await;
        assert_eq!(setup.server.closed_with(), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle(&setup.socket).await;
        assert_eq!(setup.server.closed_with(), None);

        // Next check happens 150ms + 300ms after the start.
        setup.server.set_buffered_amount(0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        settle(&setup.socket).await;
        assert_eq!(setup.server.closed_with(), Some((None, None)));
        disconnect.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_callbacks_and_off() {
        let connector = MemoryConnector::new().auto_open();
        let socket = memory_socket(&connector);
        let (opens, on_open) = counter();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let open_ref = socket.on_open(on_open);
        {
            let errors = errors.clone();
            socket.on_error(move |event| errors.lock().unwrap().push(event.clone()));
        }

        socket.connect();
        settle(&socket).await;
        assert_eq!(*opens.lock().unwrap(), 1);

        let server = connector.last().unwrap();
        server.error("boom");
        settle(&socket).await;
        assert_eq!(
            *errors.lock().unwrap(),
            vec![ErrorEvent {
                error: "boom".into(),
                transport: "memory",
                established_connections: 1,
            }]
        );

        socket.off(&[open_ref]);
        server.close(1006, "", false);
        tokio::time::sleep(Duration::from_millis(11)).await;
        settle(&socket).await;
        assert_eq!(connector.connection_count(), 2);
        assert_eq!(*opens.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_callbacks_see_decoded_messages() {
        let setup = MemorySetup::connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            setup
                .socket
                .on_message(move |message| seen.lock().unwrap().push(message.event.clone()));
        }

        setup
            .server
            .push_frame(Frame::Text("not a message".into()));
        setup
            .server
            .push(&Message::new("room:9", "news", serde_json::json!({})));
        settle(&setup.socket).await;

        assert_eq!(*seen.lock().unwrap(), ["news"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_round_trip() {
        let setup = MemorySetup::connected().await;
        let socket = setup.socket.clone();
        let ping = tokio::spawn(async move { socket.ping().await });
        settle(&setup.socket).await;

        let request = setup.server.take_sent().remove(0);
        assert_eq!(request.event, "heartbeat");
        tokio::time::sleep(Duration::from_millis(25)).await;
        setup
            .server
            .reply(&request, Reply::new("ok", serde_json::json!({})));

        let elapsed = ping.await.unwrap().unwrap();
        assert!(elapsed >= Duration::from_millis(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_requires_connection() {
        let connector = MemoryConnector::new();
        let socket = memory_socket(&connector);
        assert!(matches!(socket.ping().await, Err(SocketError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_transport_ignores_old_connection() {
        let setup = MemorySetup::connected().await;
        let seen = Arc::new(Mutex::new(0));
        {
            let seen = seen.clone();
            setup.socket.on_message(move |_| *seen.lock().unwrap() += 1);
        }

        let replacement = MemoryConnector::new().auto_open();
        setup.socket.replace_transport(Arc::new(replacement.clone()));
        setup.socket.connect();
        settle(&setup.socket).await;

        assert_eq!(replacement.connection_count(), 1);
        assert_eq!(setup.connector.connection_count(), 1);
        assert!(setup.server.closed_with().is_some());

        setup
            .server
            .push(&Message::new("room:1", "stale", serde_json::json!({})));
        replacement
            .last()
            .unwrap()
            .push(&Message::new("room:1", "fresh", serde_json::json!({})));
        settle(&setup.socket).await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_hide_and_show() {
        let connector = MemoryConnector::new().auto_open();
        let (notifier, signal) = LifecycleSignal::channel();
        let socket = Socket::new(
            "ws://test/socket",
            memory_options(&connector).with_lifecycle(signal),
        )
        .unwrap();
        socket.connect();
        settle(&socket).await;

        notifier.hide();
        settle(&socket).await;
        assert_eq!(socket.connection_state().await.unwrap(), ReadyState::Closed);

        notifier.show();
        settle(&socket).await;
        assert_eq!(connector.connection_count(), 2);
        assert!(socket.is_connected().await.unwrap());

        // An explicit disconnect after a hide wins over the next show.
        notifier.hide();
        settle(&socket).await;
        socket.connect();
        settle(&socket).await;
        socket.disconnect(None, None).await.unwrap();
        notifier.show();
        settle(&socket).await;
        assert_eq!(connector.connection_count(), 3);
        assert_eq!(socket.connection_state().await.unwrap(), ReadyState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logger_sees_pushes() {
        let connector = MemoryConnector::new().auto_open();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let options = {
            let lines = lines.clone();
            memory_options(&connector).with_logger(move |kind, msg, _| {
                lines.lock().unwrap().push(format!("{kind}: {msg}"));
            })
        };
        let socket = Socket::new("ws://test/socket", options).unwrap();
        socket.connect();
        socket.push(Message::new("room:1", "shout", serde_json::json!({})).with_ref("7"));
        settle(&socket).await;

        assert!(lines
            .lock()
            .unwrap()
            .contains(&"push: room:1 shout (, 7)".to_string()));
    }

    #[tokio::test]
    async fn test_channel_handle_keeps_socket_alive() {
        let connector = MemoryConnector::new().auto_open();
        let socket = memory_socket(&connector);
        socket.connect();
        let channel = socket.channel("room:1", serde_json::json!({}));
        let weak = Arc::downgrade(socket.shared());
        drop(socket);

        assert!(weak.upgrade().is_some());
        drop(channel);
        assert!(weak.upgrade().is_none());
    }
}
