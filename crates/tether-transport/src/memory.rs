//! In-process transport for tests and embedding.
//!
//! A [`MemoryConnector`] records every connection it opens as a
//! [`MemoryServer`], which plays the remote end: it decides when the
//! connection opens, pushes server frames, injects errors and closes, and
//! exposes everything the client sent.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_protocol::{decode_client_frame, encode_server_frame, Frame, Message, Reply};

use crate::traits::{
    CloseEvent, ConnectOptions, Connector, EventSink, ReadyState, Transport, TransportError,
    TransportEvent, CLOSE_NORMAL,
};

#[derive(Debug)]
struct ConnState {
    ready: ReadyState,
    sent: Vec<Frame>,
    buffered: usize,
    closed_with: Option<(Option<u16>, Option<String>)>,
}

#[derive(Debug)]
struct Conn {
    url: String,
    skip_heartbeat: bool,
    state: Mutex<ConnState>,
    events: EventSink,
}

impl Conn {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct Registry {
    connections: Vec<MemoryServer>,
    auto_open: bool,
    skip_heartbeat: bool,
}

/// Connector producing in-memory transports.
///
/// Clones share the same registry of connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryConnector {
    /// Create a connector whose connections stay `Connecting` until
    /// [`MemoryServer::open`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every new connection immediately.
    #[must_use]
    pub fn auto_open(self) -> Self {
        self.lock().auto_open = true;
        self
    }

    /// Make transports ask the socket to skip heartbeats, as long-poll does.
    #[must_use]
    pub fn skipping_heartbeat(self) -> Self {
        self.lock().skip_heartbeat = true;
        self
    }

    /// All connections opened so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<MemoryServer> {
        self.lock().connections.clone()
    }

    /// Number of connection attempts so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// The most recent connection.
    #[must_use]
    pub fn last(&self) -> Option<MemoryServer> {
        self.lock().connections.last().cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        url: &str,
        _options: &ConnectOptions,
        events: EventSink,
    ) -> Box<dyn Transport> {
        let (server, auto_open) = {
            let mut registry = self.lock();
            let server = MemoryServer {
                conn: Arc::new(Conn {
                    url: url.to_string(),
                    skip_heartbeat: registry.skip_heartbeat,
                    state: Mutex::new(ConnState {
                        ready: ReadyState::Connecting,
                        sent: Vec::new(),
                        buffered: 0,
                        closed_with: None,
                    }),
                    events,
                }),
            };
            registry.connections.push(server.clone());
            (server, registry.auto_open)
        };

        if auto_open {
            server.open();
        }
        Box::new(MemoryTransport {
            conn: server.conn.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// The remote end of an in-memory connection.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    conn: Arc<Conn>,
}

impl MemoryServer {
    /// URL the client connected to.
    #[must_use]
    pub fn url(&self) -> String {
        self.conn.url.clone()
    }

    /// Current ready state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.conn.lock().ready
    }

    /// Accept the connection.
    pub fn open(&self) {
        self.conn.lock().ready = ReadyState::Open;
        self.conn.events.emit(TransportEvent::Open);
    }

    /// Deliver a message to the client.
    ///
    /// # Panics
    ///
    /// Panics if the message cannot be encoded as a server frame.
    pub fn push(&self, message: &Message) {
        let frame = encode_server_frame(message).expect("encodable server message");
        self.push_frame(frame);
    }

    /// Deliver a raw frame to the client.
    pub fn push_frame(&self, frame: Frame) {
        self.conn.events.emit(TransportEvent::Message(frame));
    }

    /// Reply to a request the client sent.
    ///
    /// # Panics
    ///
    /// Panics if the request carries no reference.
    pub fn reply(&self, request: &Message, reply: Reply) {
        let reference = request.reference.clone().expect("request with a ref");
        let mut message = Message::reply(request.topic.clone(), reference, reply);
        message.join_ref = request.join_ref.clone();
        self.push(&message);
    }

    /// Report a transport error to the client.
    pub fn error(&self, reason: &str) {
        self.conn.events.emit(TransportEvent::Error(reason.to_string()));
    }

    /// Close the connection from the server side.
    pub fn close(&self, code: u16, reason: &str, was_clean: bool) {
        self.conn.lock().ready = ReadyState::Closed;
        self.conn
            .events
            .emit(TransportEvent::Close(CloseEvent::new(code, reason, was_clean)));
    }

    /// Pretend `bytes` are waiting in the send buffer.
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.conn.lock().buffered = bytes;
    }

    /// Raw frames the client sent.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.conn.lock().sent.clone()
    }

    /// Messages the client sent, decoded.
    ///
    /// # Panics
    ///
    /// Panics if the client sent an undecodable frame.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.sent_frames()
            .into_iter()
            .map(|frame| decode_client_frame(frame).expect("decodable client frame"))
            .collect()
    }

    /// Drain and decode the messages the client sent.
    ///
    /// # Panics
    ///
    /// Panics if the client sent an undecodable frame.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut self.conn.lock().sent)
            .into_iter()
            .map(|frame| decode_client_frame(frame).expect("decodable client frame"))
            .collect()
    }

    /// The code and reason the client closed with, if it closed.
    #[must_use]
    pub fn closed_with(&self) -> Option<(Option<u16>, Option<String>)> {
        self.conn.lock().closed_with.clone()
    }
}

struct MemoryTransport {
    conn: Arc<Conn>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let mut state = self.conn.lock();
        match state.ready {
            ReadyState::Open => {
                state.sent.push(frame);
                Ok(())
            }
            ReadyState::Connecting => Err(TransportError::NotOpen),
            ReadyState::Closing | ReadyState::Closed => Err(TransportError::ConnectionClosed),
        }
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) {
        {
            let mut state = self.conn.lock();
            if state.ready == ReadyState::Closed {
                return;
            }
            state.ready = ReadyState::Closed;
            state.closed_with = Some((code, reason.map(str::to_string)));
        }
        self.conn.events.emit(TransportEvent::Close(CloseEvent::new(
            code.unwrap_or(CLOSE_NORMAL),
            reason.unwrap_or_default(),
            true,
        )));
    }

    fn ready_state(&self) -> ReadyState {
        self.conn.lock().ready
    }

    fn buffered_amount(&self) -> usize {
        self.conn.lock().buffered
    }

    fn skip_heartbeat(&self) -> bool {
        self.conn.skip_heartbeat
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
