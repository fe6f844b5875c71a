//! Serializer for Tether frames.
//!
//! Messages travel either as text frames holding the JSON array
//! `[join_ref, ref, topic, event, payload]`, or as binary frames when the
//! payload is raw bytes. Binary frames start with a one-byte kind, then one
//! length byte per string field, then the field bytes, then the payload:
//!
//! ```text
//! client push: [0][join_ref][ref][topic][event] join_ref ref topic event payload
//! server push: [0][join_ref][topic][event]      join_ref topic event payload
//! reply:       [1][join_ref][ref][topic][status] join_ref ref topic status response
//! broadcast:   [2][topic][event]                 topic event payload
//! ```
//!
//! [`encode`] and [`decode`] are the client side of the wire. The layout is
//! asymmetric by direction, so [`encode_server_frame`] and
//! [`decode_client_frame`] provide the counterpart used by peers and tests.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::message::{events, Frame, FrameKind, Message, Payload};

/// Kind byte length.
pub const HEADER_LENGTH: usize = 1;

/// Number of length bytes in a client push header.
pub const META_LENGTH: usize = 4;

/// Maximum length of a string field in a binary frame.
pub const MAX_FIELD_LENGTH: usize = u8::MAX as usize;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A string field does not fit its one-byte length prefix.
    #[error("Field `{field}` is {len} bytes, binary frames allow at most {MAX_FIELD_LENGTH}")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length in bytes.
        len: usize,
    },

    /// The frame ended before all declared fields were read.
    #[error("Truncated frame: need {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown binary frame kind.
    #[error("Unknown frame kind {0}")]
    UnknownKind(u8),

    /// A string field is not valid UTF-8.
    #[error("Invalid UTF-8 in frame: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

type TextFrame = (Option<String>, Option<String>, String, String, Value);

/// Encode a client message.
///
/// Binary payloads produce a binary push frame; JSON payloads produce a text
/// frame.
///
/// # Errors
///
/// Returns an error if a field is too long for a binary frame, or if the
/// payload is a [`Payload::BinaryReply`] (only servers send replies).
pub fn encode(message: &Message) -> Result<Frame, ProtocolError> {
    match &message.payload {
        Payload::Json(value) => encode_text(message, value),
        Payload::Binary(data) => {
            let join_ref = message.join_ref.as_deref().unwrap_or_default();
            let reference = message.reference.as_deref().unwrap_or_default();
            encode_binary(
                FrameKind::Push,
                &[
                    ("join_ref", join_ref),
                    ("ref", reference),
                    ("topic", message.topic.as_str()),
                    ("event", message.event.as_str()),
                ],
                data,
            )
        }
        Payload::BinaryReply { .. } => Err(ProtocolError::Invalid(
            "binary replies are only sent by servers".into(),
        )),
    }
}

/// Decode a frame received from a server.
///
/// # Errors
///
/// Returns an error if the frame is malformed.
pub fn decode(frame: Frame) -> Result<Message, ProtocolError> {
    match frame {
        Frame::Text(text) => decode_text(&text),
        Frame::Binary(data) => {
            let kind = binary_kind(&data)?;
            match kind {
                FrameKind::Push => {
                    let mut reader = FieldReader::new(&data, 3)?;
                    let join_ref = reader.next_ref()?;
                    let topic = reader.next_field()?;
                    let event = reader.next_field()?;
                    Ok(Message {
                        join_ref,
                        reference: None,
                        topic,
                        event,
                        payload: Payload::Binary(reader.rest()),
                    })
                }
                FrameKind::Reply => {
                    let mut reader = FieldReader::new(&data, 4)?;
                    let join_ref = reader.next_ref()?;
                    let reference = reader.next_ref()?;
                    let topic = reader.next_field()?;
                    let status = reader.next_field()?;
                    Ok(Message {
                        join_ref,
                        reference,
                        topic,
                        event: events::REPLY.to_string(),
                        payload: Payload::BinaryReply {
                            status,
                            response: reader.rest(),
                        },
                    })
                }
                FrameKind::Broadcast => {
                    let mut reader = FieldReader::new(&data, 2)?;
                    let topic = reader.next_field()?;
                    let event = reader.next_field()?;
                    Ok(Message {
                        join_ref: None,
                        reference: None,
                        topic,
                        event,
                        payload: Payload::Binary(reader.rest()),
                    })
                }
            }
        }
    }
}

/// Encode a message the way a server sends it.
///
/// Binary replies become reply frames, binary messages without references
/// become broadcasts, and other binary messages become server pushes (which
/// carry no ref).
///
/// # Errors
///
/// Returns an error if a field is too long, or if a binary push carries a ref.
pub fn encode_server_frame(message: &Message) -> Result<Frame, ProtocolError> {
    let join_ref = message.join_ref.as_deref().unwrap_or_default();
    let reference = message.reference.as_deref().unwrap_or_default();

    match &message.payload {
        Payload::Json(value) => encode_text(message, value),
        Payload::BinaryReply { status, response } => encode_binary(
            FrameKind::Reply,
            &[
                ("join_ref", join_ref),
                ("ref", reference),
                ("topic", message.topic.as_str()),
                ("status", status.as_str()),
            ],
            response,
        ),
        Payload::Binary(data) if message.join_ref.is_none() && message.reference.is_none() => {
            encode_binary(
                FrameKind::Broadcast,
                &[("topic", message.topic.as_str()), ("event", message.event.as_str())],
                data,
            )
        }
        Payload::Binary(data) => {
            if message.reference.is_some() {
                return Err(ProtocolError::Invalid(
                    "server push frames carry no ref".into(),
                ));
            }
            encode_binary(
                FrameKind::Push,
                &[
                    ("join_ref", join_ref),
                    ("topic", message.topic.as_str()),
                    ("event", message.event.as_str()),
                ],
                data,
            )
        }
    }
}

/// Decode a frame sent by a client.
///
/// # Errors
///
/// Returns an error if the frame is malformed or is not a push.
pub fn decode_client_frame(frame: Frame) -> Result<Message, ProtocolError> {
    match frame {
        Frame::Text(text) => decode_text(&text),
        Frame::Binary(data) => match binary_kind(&data)? {
            FrameKind::Push => {
                let mut reader = FieldReader::new(&data, META_LENGTH)?;
                let join_ref = reader.next_ref()?;
                let reference = reader.next_ref()?;
                let topic = reader.next_field()?;
                let event = reader.next_field()?;
                Ok(Message {
                    join_ref,
                    reference,
                    topic,
                    event,
                    payload: Payload::Binary(reader.rest()),
                })
            }
            other => Err(ProtocolError::Invalid(format!(
                "clients only send push frames, got {other:?}"
            ))),
        },
    }
}

fn encode_text(message: &Message, payload: &Value) -> Result<Frame, ProtocolError> {
    let array = (
        &message.join_ref,
        &message.reference,
        &message.topic,
        &message.event,
        payload,
    );
    Ok(Frame::Text(serde_json::to_string(&array)?))
}

fn decode_text(text: &str) -> Result<Message, ProtocolError> {
    let (join_ref, reference, topic, event, payload): TextFrame = serde_json::from_str(text)?;
    Ok(Message {
        join_ref,
        reference,
        topic,
        event,
        payload: Payload::Json(payload),
    })
}

fn encode_binary(
    kind: FrameKind,
    fields: &[(&'static str, &str)],
    payload: &Bytes,
) -> Result<Frame, ProtocolError> {
    let meta: usize = fields.iter().map(|(_, value)| value.len()).sum();
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + fields.len() + meta + payload.len());

    buf.put_u8(kind.into());
    for &(field, value) in fields {
        let len = u8::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
            field,
            len: value.len(),
        })?;
        buf.put_u8(len);
    }
    for (_, value) in fields {
        buf.extend_from_slice(value.as_bytes());
    }
    buf.extend_from_slice(payload);

    Ok(Frame::Binary(buf.freeze()))
}

fn binary_kind(data: &Bytes) -> Result<FrameKind, ProtocolError> {
    let byte = *data.first().ok_or(ProtocolError::Truncated {
        expected: HEADER_LENGTH,
        actual: 0,
    })?;
    FrameKind::try_from(byte).map_err(ProtocolError::UnknownKind)
}

/// Sequential reader over the length-prefixed string fields of a binary frame.
struct FieldReader<'a> {
    data: &'a Bytes,
    count: usize,
    index: usize,
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a Bytes, count: usize) -> Result<Self, ProtocolError> {
        let header = HEADER_LENGTH + count;
        if data.len() < header {
            return Err(ProtocolError::Truncated {
                expected: header,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            count,
            index: 0,
            offset: header,
        })
    }

    fn next_field(&mut self) -> Result<String, ProtocolError> {
        debug_assert!(self.index < self.count);
        let size = usize::from(self.data[HEADER_LENGTH + self.index]);
        let end = self.offset + size;
        let raw = self
            .data
            .get(self.offset..end)
            .ok_or(ProtocolError::Truncated {
                expected: end,
                actual: self.data.len(),
            })?;
        let field = std::str::from_utf8(raw)?.to_owned();
        self.index += 1;
        self.offset = end;
        Ok(field)
    }

    /// An empty reference field decodes as absent.
    fn next_ref(&mut self) -> Result<Option<String>, ProtocolError> {
        let field = self.next_field()?;
        Ok((!field.is_empty()).then_some(field))
    }

    fn rest(self) -> Bytes {
        self.data.slice(self.offset..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Reply;
    use serde_json::json;

    fn join_message() -> Message {
        Message::new("room:lobby", "phx_join", json!({"token": "abc"}))
            .with_join_ref("1")
            .with_ref("1")
    }

    #[test]
    fn test_text_encode_layout() {
        let frame = encode(&join_message()).unwrap();
        assert_eq!(
            frame,
            Frame::Text(r#"["1","1","room:lobby","phx_join",{"token":"abc"}]"#.into())
        );

        let heartbeat = encode(&Message::heartbeat("3")).unwrap();
        assert_eq!(
            heartbeat,
            Frame::Text(r#"[null,"3","phoenix","heartbeat",{}]"#.into())
        );
    }

    #[test]
    fn test_text_roundtrip() {
        let messages = vec![
            join_message(),
            Message::heartbeat("99"),
            Message::new("room:1", "new_msg", json!({"body": "hi", "n": [1, 2]})),
            Message::reply("room:1", "4", Reply::new("ok", json!({"id": 1}))).with_join_ref("2"),
        ];

        for message in messages {
            let client = decode_client_frame(encode(&message).unwrap()).unwrap();
            assert_eq!(client, message);
            let server = decode(encode_server_frame(&message).unwrap()).unwrap();
            assert_eq!(server, message);
        }
    }

    #[test]
    fn test_binary_push_layout() {
        let message = Message::new("top", "ev", vec![0xAA, 0xBB])
            .with_join_ref("12")
            .with_ref("3");
        let Frame::Binary(data) = encode(&message).unwrap() else {
            panic!("expected a binary frame");
        };
        assert_eq!(
            &data[..],
            &[0, 2, 1, 3, 2, b'1', b'2', b'3', b't', b'o', b'p', b'e', b'v', 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_binary_client_roundtrip() {
        let message = Message::new("t".repeat(255), "e".repeat(255), vec![1u8, 2, 3])
            .with_join_ref("j".repeat(255))
            .with_ref("r".repeat(255));
        let decoded = decode_client_frame(encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_binary_server_frames() {
        let broadcast = Message::new("room:1", "blob", vec![9u8, 8]);
        let push = Message::new("room:1", "blob", vec![7u8]).with_join_ref("5");
        let reply = Message::reply("room:1", "6", Reply::new("ok", Bytes::from_static(b"raw")))
            .with_join_ref("5");

        for message in [broadcast, push, reply] {
            let decoded = decode(encode_server_frame(&message).unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_binary_reply_decode() {
        let data = Bytes::from_static(&[1, 1, 2, 2, 2, b'5', b'1', b'0', b'r', b'1', b'o', b'k', 0xFF]);
        let message = decode(Frame::Binary(data)).unwrap();
        assert_eq!(message.event, "phx_reply");
        assert_eq!(message.join_ref.as_deref(), Some("5"));
        assert_eq!(message.reference.as_deref(), Some("10"));
        assert_eq!(message.topic, "r1");
        let reply = Reply::from_payload(&message.payload).unwrap();
        assert_eq!(reply.status, "ok");
        assert_eq!(reply.response, Payload::Binary(Bytes::from_static(&[0xFF])));
    }

    #[test]
    fn test_field_too_long() {
        let message = Message::new("t".repeat(256), "e", vec![0u8]);
        match encode(&message) {
            Err(ProtocolError::FieldTooLong { field, len }) => {
                assert_eq!(field, "topic");
                assert_eq!(len, 256);
            }
            other => panic!("Expected FieldTooLong error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated() {
        let data = Bytes::from_static(&[2, 5, 1, b'a']);
        match decode(Frame::Binary(data)) {
            Err(ProtocolError::Truncated { .. }) => {}
            other => panic!("Expected Truncated error, got {:?}", other),
        }

        match decode(Frame::Binary(Bytes::new())) {
            Err(ProtocolError::Truncated { expected: 1, actual: 0 }) => {}
            other => panic!("Expected Truncated error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_kind() {
        match decode(Frame::Binary(Bytes::from_static(&[9, 0, 0]))) {
            Err(ProtocolError::UnknownKind(9)) => {}
            other => panic!("Expected UnknownKind error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_text() {
        assert!(matches!(
            decode(Frame::Text(r#"{"topic":"x"}"#.into())),
            Err(ProtocolError::Json(_))
        ));
    }
}
