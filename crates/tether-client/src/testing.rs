//! Helpers for tests driven by the in-memory transport.

use std::sync::Arc;

use serde_json::json;
use tether_protocol::Reply;
use tether_transport::memory::{MemoryConnector, MemoryServer};

use crate::{Channel, Socket, SocketOptions};

pub(crate) const ENDPOINT: &str = "ws://test/socket";

pub(crate) fn memory_options(connector: &MemoryConnector) -> SocketOptions {
    SocketOptions::default().with_connector(Arc::new(connector.clone()))
}

pub(crate) fn memory_socket(connector: &MemoryConnector) -> Socket {
    Socket::new(ENDPOINT, memory_options(connector)).unwrap()
}

/// Let the socket process everything queued so far, including commands
/// queued while processing.
pub(crate) async fn settle(socket: &Socket) {
    for _ in 0..4 {
        tokio::task::yield_now().await;
        socket.shared().inspect(|_| ()).await.unwrap();
    }
}

/// A socket connected to an open in-memory server.
pub(crate) struct MemorySetup {
    pub(crate) socket: Socket,
    pub(crate) connector: MemoryConnector,
    pub(crate) server: MemoryServer,
}

impl MemorySetup {
    pub(crate) async fn connected() -> Self {
        let connector = MemoryConnector::new().auto_open();
        let socket = memory_socket(&connector);
        socket.connect();
        settle(&socket).await;
        let server = connector.last().unwrap();
        Self {
            socket,
            connector,
            server,
        }
    }

    /// Push records the socket still holds for `channel`, join push included.
    pub(crate) async fn push_count(&self, channel: &Channel) -> usize {
        let id = channel.id();
        self.socket
            .shared()
            .inspect(move |actor| actor.channels.get(id).map_or(0, |c| c.pushes.len()))
            .await
            .unwrap()
    }
}

/// Create a channel on `topic` and complete its join.
pub(crate) async fn joined_channel(setup: &MemorySetup, topic: &str) -> Channel {
    let channel = setup.socket.channel(topic, json!({}));
    channel.join().unwrap();
    settle(&setup.socket).await;

    let join = setup
        .server
        .take_sent()
        .into_iter()
        .find(|m| m.event == "phx_join" && m.topic == topic)
        .unwrap();
    setup.server.reply(&join, Reply::new("ok", json!({})));
    settle(&setup.socket).await;
    channel
}
