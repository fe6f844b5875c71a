//! Message types for the Tether channel protocol.
//!
//! A [`Message`] is the logical record exchanged over a socket: it names a
//! topic and an event, optionally carries the join reference of the channel
//! instance and the reference of the request it belongs to, and holds an
//! opaque payload.

use bytes::Bytes;
use serde_json::{Map, Value};

/// Topic reserved for socket-level control traffic (heartbeats).
pub const CONTROL_TOPIC: &str = "phoenix";

/// Reserved event names.
pub mod events {
    /// Channel was closed.
    pub const CLOSE: &str = "phx_close";
    /// Channel crashed or the connection failed.
    pub const ERROR: &str = "phx_error";
    /// Join request.
    pub const JOIN: &str = "phx_join";
    /// Reply to a push.
    pub const REPLY: &str = "phx_reply";
    /// Leave request.
    pub const LEAVE: &str = "phx_leave";
    /// Heartbeat request on the control topic.
    pub const HEARTBEAT: &str = "heartbeat";

    /// Events whose join reference must match the current channel instance.
    pub const LIFECYCLE: [&str; 5] = [CLOSE, ERROR, JOIN, REPLY, LEAVE];

    /// Check if an event is a channel lifecycle event.
    #[must_use]
    pub fn is_lifecycle(event: &str) -> bool {
        LIFECYCLE.contains(&event)
    }
}

/// Well-known reply statuses.
pub mod status {
    /// The request succeeded.
    pub const OK: &str = "ok";
    /// The request was rejected.
    pub const ERROR: &str = "error";
    /// No reply arrived in time. Never sent over the wire.
    pub const TIMEOUT: &str = "timeout";
}

/// Binary frame kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Push = 0,
    Reply = 1,
    Broadcast = 2,
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Push),
            1 => Ok(FrameKind::Reply),
            2 => Ok(FrameKind::Broadcast),
            other => Err(other),
        }
    }
}

/// A raw transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A textual frame (JSON array).
    Text(String),
    /// A binary frame.
    Binary(Bytes),
}

impl Frame {
    /// Size of the frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    /// Check if the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A JSON value, sent as a text frame.
    Json(Value),
    /// Raw bytes, sent as a binary frame.
    Binary(Bytes),
    /// A decoded binary reply: the status plus the raw response.
    BinaryReply {
        /// Reply status.
        status: String,
        /// Raw response bytes.
        response: Bytes,
    },
}

impl Payload {
    /// An empty JSON object.
    #[must_use]
    pub fn empty() -> Self {
        Payload::Json(Value::Object(Map::new()))
    }

    /// Check if this payload travels in binary frames.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        !matches!(self, Payload::Json(_))
    }

    /// Get the JSON value, if this is a JSON payload.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Get the raw bytes, if this is a binary payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(data) => Some(data),
            Payload::BinaryReply { response, .. } => Some(response),
            Payload::Json(_) => None,
        }
    }

    /// The `status` field of a reply payload, if any.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        match self {
            Payload::Json(value) => value.get("status").and_then(Value::as_str),
            Payload::BinaryReply { status, .. } => Some(status),
            Payload::Binary(_) => None,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Binary(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(data))
    }
}

/// A reply to a push, as seen by the push's hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Reply status (`ok`, `error`, `timeout` or a channel-defined tag).
    pub status: String,
    /// Reply body.
    pub response: Payload,
}

impl Reply {
    /// Create a new reply.
    #[must_use]
    pub fn new(status: impl Into<String>, response: impl Into<Payload>) -> Self {
        Self {
            status: status.into(),
            response: response.into(),
        }
    }

    /// The local pseudo-reply produced when a push times out.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new(status::TIMEOUT, Payload::empty())
    }

    /// Parse a `phx_reply` payload.
    ///
    /// Text replies are JSON objects `{"status": .., "response": ..}`; a
    /// missing response is treated as an empty object.
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Json(Value::Object(map)) => {
                let status = map.get("status")?.as_str()?;
                let response = map
                    .get("response")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                Some(Self::new(status, response))
            }
            Payload::BinaryReply { status, response } => {
                Some(Self::new(status.clone(), response.clone()))
            }
            _ => None,
        }
    }

    /// Convert back into the payload of a `phx_reply` message.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        match self.response {
            Payload::Json(response) => {
                let mut map = Map::new();
                map.insert("status".into(), Value::String(self.status));
                map.insert("response".into(), response);
                Payload::Json(Value::Object(map))
            }
            Payload::Binary(response) | Payload::BinaryReply { response, .. } => {
                Payload::BinaryReply {
                    status: self.status,
                    response,
                }
            }
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Join reference of the channel instance this message belongs to.
    pub join_ref: Option<String>,
    /// Reference of the request, used to match replies.
    pub reference: Option<String>,
    /// Topic name.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Payload.
    pub payload: Payload,
}

impl Message {
    /// Create a new message without references.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            join_ref: None,
            reference: None,
            topic: topic.into(),
            event: event.into(),
            payload: payload.into(),
        }
    }

    /// Set the request reference.
    #[must_use]
    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Set the join reference.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Create a heartbeat request.
    #[must_use]
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self::new(CONTROL_TOPIC, events::HEARTBEAT, Payload::empty()).with_ref(reference)
    }

    /// Create a reply message for the request `reference` on `topic`.
    #[must_use]
    pub fn reply(topic: impl Into<String>, reference: impl Into<String>, reply: Reply) -> Self {
        Self::new(topic, events::REPLY, reply.into_payload()).with_ref(reference)
    }
}
