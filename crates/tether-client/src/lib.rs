//! # tether-client
//!
//! Channel client for Tether servers.
//!
//! One [`Socket`] multiplexes many [`Channel`]s over a single WebSocket or
//! long-poll connection:
//!
//! - **Socket** - Connection, heartbeat, reconnect with backoff, send buffer
//! - **Channel** - Join/leave lifecycle, event bindings, rejoin with backoff
//! - **Push** - One request awaiting at most one reply, or a timeout
//! - **Presence** - Roster synced from snapshots and diffs
//!
//! ## Architecture
//!
//! ```text
//!  Socket ─┐                      ┌─▶ Transport (websocket / longpoll)
//!  Channel ├─ commands ─▶ actor ──┤
//!  Push   ─┘   (mpsc)     task    └─▶ timers (reconnect, heartbeat,
//!                           ▲              rejoin, push timeouts)
//!                           └──── transport events, timer expiries
//! ```
//!
//! Handles are cheap to clone and never block. Everything that changes
//! state runs on the socket's task, one command at a time.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tether_client::{Socket, SocketOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = Socket::new("wss://example.com/socket", SocketOptions::default())?;
//! socket.connect();
//!
//! let channel = socket.channel("room:lobby", json!({"token": "secret"}));
//! channel.on("new_msg", |event| println!("{:?}", event.payload));
//! channel.join()?.receive("ok", |_| println!("joined"));
//! channel.push("new_msg", json!({"body": "hi"}))?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod lifecycle;
pub mod metrics;
pub mod options;
pub mod presence;
pub mod push;
pub mod socket;

mod timer;

#[cfg(test)]
mod testing;

pub use channel::{BindingRef, Channel, ChannelError, ChannelState, Event};
pub use lifecycle::{LifecycleEvent, LifecycleNotifier, LifecycleSignal};
pub use options::{default_reconnect_after, default_rejoin_after, Params, SocketOptions};
pub use presence::{Presence, PresenceDiff, PresenceEntry, PresenceMeta, PresenceOptions, PresenceState};
pub use push::Push;
pub use socket::{CallbackRef, ErrorEvent, Socket, SocketError};

pub use tether_protocol::{Message, Payload, Reply};
pub use tether_transport::{CloseEvent, ReadyState, TransportKind};
