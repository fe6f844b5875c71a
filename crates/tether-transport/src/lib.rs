//! # tether-transport
//!
//! Transport abstraction layer for the Tether channel client.
//!
//! This crate provides a unified interface for different transport protocols:
//!
//! - **WebSocket** - The standard, works everywhere
//! - **Long-poll** - Plain HTTP for networks that block WebSockets
//! - **Memory** - In-process transport for tests
//!
//! ## Transport Abstraction
//!
//! A [`Connector`] opens a [`Transport`] and reports what happens to it
//! through an [`EventSink`], allowing the socket to be protocol-agnostic.
//!
//! ```rust
//! use tether_transport::memory::MemoryConnector;
//! use tether_transport::{ConnectOptions, Connector, EventSink, ReadyState};
//!
//! let connector = MemoryConnector::new();
//! let transport = connector.connect(
//!     "ws://localhost/socket/websocket",
//!     &ConnectOptions::default(),
//!     EventSink::new(|event| println!("{event:?}")),
//! );
//! assert_eq!(transport.ready_state(), ReadyState::Connecting);
//!
//! connector.last().unwrap().open();
//! assert_eq!(transport.ready_state(), ReadyState::Open);
//! ```

pub mod kind;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "longpoll")]
pub mod longpoll;

pub use kind::TransportKind;
pub use traits::{
    CloseEvent, ConnectOptions, Connector, EventSink, ReadyState, SharedState, Transport,
    TransportError, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_NO_STATUS,
};

#[cfg(feature = "longpoll")]
pub use longpoll::LongPollConnector;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
