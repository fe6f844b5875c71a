//! Transport abstraction traits for Tether.
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. The
//! transport reports everything that happens to it (open, inbound frames,
//! errors, close) through the [`EventSink`] it was created with, so the
//! socket can stay agnostic of WebSocket versus long-poll.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_protocol::Frame;
use thiserror::Error;

/// Normal closure close code.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code used when no status was received.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code used when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport is not open yet.
    #[error("Connection not open")]
    NotOpen,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The transport cannot carry this kind of frame.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Details of a transport close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code.
    pub code: u16,
    /// Close reason, possibly empty.
    pub reason: String,
    /// Whether the close handshake completed.
    pub was_clean: bool,
}

impl CloseEvent {
    /// Create a close event.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    /// A connection that dropped without a close handshake.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason, false)
    }
}

/// Something that happened to a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport is open and can send.
    Open,
    /// The transport hit an error. A close usually follows.
    Error(String),
    /// An inbound frame.
    Message(Frame),
    /// The transport closed. No further events follow.
    Close(CloseEvent),
}

/// Callback through which a transport reports its events.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(TransportEvent) + Send + Sync>);

impl EventSink {
    /// Wrap a callback.
    pub fn new(f: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Report an event.
    pub fn emit(&self, event: TransportEvent) {
        (self.0)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Options passed to a connector for each connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// How long a single long-poll request may stay open.
    pub long_poll_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(20),
        }
    }
}

/// An established (or establishing) connection.
///
/// Calls never block: sends are queued and the outcome of `close` is
/// reported through the event sink.
pub trait Transport: Send {
    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not open or cannot carry the
    /// frame.
    fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Start closing the connection. A [`TransportEvent::Close`] follows.
    fn close(&mut self, code: Option<u16>, reason: Option<&str>);

    /// Current connection state.
    fn ready_state(&self) -> ReadyState;

    /// Bytes queued but not yet written.
    fn buffered_amount(&self) -> usize {
        0
    }

    /// Whether the socket should skip heartbeats on this transport.
    fn skip_heartbeat(&self) -> bool {
        false
    }

    /// Get the transport name (e.g., "websocket", "longpoll").
    fn name(&self) -> &'static str;
}

/// Factory for transports.
pub trait Connector: Send + Sync {
    /// Start connecting to `url`. Progress is reported through `events`.
    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Box<dyn Transport>;

    /// Get the transport name.
    fn name(&self) -> &'static str;

    /// Path segment appended to the socket endpoint.
    fn endpoint_suffix(&self) -> &'static str {
        "websocket"
    }
}

/// Ready state and buffered byte count shared between a transport handle and
/// its I/O task.
#[derive(Debug)]
pub struct SharedState {
    ready: AtomicU8,
    buffered: AtomicUsize,
}

impl SharedState {
    /// Create shared state in the given ready state.
    #[must_use]
    pub fn new(ready: ReadyState) -> Self {
        Self {
            ready: AtomicU8::new(ready as u8),
            buffered: AtomicUsize::new(0),
        }
    }

    /// Current ready state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::Acquire))
    }

    /// Set the ready state.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.ready.store(state as u8, Ordering::Release);
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Account for bytes entering the send queue.
    pub fn add_buffered(&self, len: usize) {
        self.buffered.fetch_add(len, Ordering::AcqRel);
    }

    /// Account for bytes leaving the send queue.
    pub fn sub_buffered(&self, len: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(len))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_shared_state_transitions() {
        let state = SharedState::new(ReadyState::Connecting);
        assert_eq!(state.ready_state(), ReadyState::Connecting);

        state.set_ready_state(ReadyState::Open);
        assert_eq!(state.ready_state(), ReadyState::Open);

        state.add_buffered(10);
        state.sub_buffered(4);
        assert_eq!(state.buffered(), 6);
        state.sub_buffered(100);
        assert_eq!(state.buffered(), 0);
    }

    #[test]
    fn test_event_sink_forwards_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            EventSink::new(move |event| seen.lock().unwrap().push(event))
        };

        sink.emit(TransportEvent::Open);
        sink.clone()
            .emit(TransportEvent::Close(CloseEvent::abnormal("gone")));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], TransportEvent::Open);
        assert!(matches!(&seen[1], TransportEvent::Close(c) if c.code == CLOSE_ABNORMAL && !c.was_clean));
    }

    #[test]
    fn test_ready_state_display() {
        assert_eq!(ReadyState::Closing.to_string(), "closing");
    }
}
