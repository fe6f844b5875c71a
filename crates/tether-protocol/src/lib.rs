//! # tether-protocol
//!
//! Wire protocol definitions for the Tether channel client.
//!
//! This crate defines the message record exchanged between clients and
//! servers, the text and binary frame formats, reference generation and
//! endpoint URL construction.
//!
//! ## Frames
//!
//! - Text frames carry `[join_ref, ref, topic, event, payload]` as JSON
//! - Binary frames carry raw payloads behind a kind byte and length-prefixed
//!   string fields (push, reply, broadcast)
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use tether_protocol::{serializer, Message};
//!
//! let message = Message::new("room:lobby", "new_msg", json!({"body": "hi"}))
//!     .with_join_ref("1")
//!     .with_ref("2");
//!
//! let frame = serializer::encode(&message).unwrap();
//! let decoded = serializer::decode_client_frame(frame).unwrap();
//! assert_eq!(decoded, message);
//! ```

pub mod endpoint;
pub mod message;
pub mod reference;
pub mod serializer;
pub mod version;

pub use endpoint::{endpoint_url, EndpointError, PageContext};
pub use message::{events, status, Frame, FrameKind, Message, Payload, Reply, CONTROL_TOPIC};
pub use reference::{RefCounter, MAX_REF};
pub use serializer::{decode, decode_client_frame, encode, encode_server_frame, ProtocolError};
pub use version::{Version, PROTOCOL_VERSION};
