//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! Each connection runs on its own task; the [`WebSocketTransport`] handle
//! queues outbound frames to it and shares the ready state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tether_protocol::Frame;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
    tungstenite::Message,
};
use tracing::{debug, warn};

use crate::traits::{
    CloseEvent, ConnectOptions, Connector, EventSink, ReadyState, SharedState, Transport,
    TransportError, TransportEvent, CLOSE_NORMAL, CLOSE_NO_STATUS,
};

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// How long to wait for the peer to answer a close frame.
    pub close_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            max_message_size: 64 << 20, // 64 MB
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens WebSocket connections.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    settings: WebSocketSettings,
}

impl WebSocketConnector {
    /// Create a connector with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector with custom settings.
    #[must_use]
    pub fn with_settings(settings: WebSocketSettings) -> Self {
        Self { settings }
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        url: &str,
        _options: &ConnectOptions,
        events: EventSink,
    ) -> Box<dyn Transport> {
        let state = Arc::new(SharedState::new(ReadyState::Connecting));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(
            url.to_string(),
            self.settings.clone(),
            state.clone(),
            outgoing_rx,
            events,
        ));

        Box::new(WebSocketTransport {
            state,
            outgoing: outgoing_tx,
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

enum Outgoing {
    Frame(Frame),
    Close(Option<CloseFrame<'static>>),
}

/// Handle to a WebSocket connection.
///
/// Dropping the handle closes the connection.
pub struct WebSocketTransport {
    state: Arc<SharedState>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.state.ready_state() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        let len = frame.len();
        self.state.add_buffered(len);
        self.outgoing.send(Outgoing::Frame(frame)).map_err(|_| {
            self.state.sub_buffered(len);
            TransportError::ConnectionClosed
        })
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) {
        match self.state.ready_state() {
            ReadyState::Closing | ReadyState::Closed => return,
            _ => self.state.set_ready_state(ReadyState::Closing),
        }
        let frame = CloseFrame {
            code: CloseCode::from(code.unwrap_or(CLOSE_NORMAL)),
            reason: reason.unwrap_or_default().to_string().into(),
        };
        let _ = self.outgoing.send(Outgoing::Close(Some(frame)));
    }

    fn ready_state(&self) -> ReadyState {
        self.state.ready_state()
    }

    fn buffered_amount(&self) -> usize {
        self.state.buffered()
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

async fn run_connection(
    url: String,
    settings: WebSocketSettings,
    state: Arc<SharedState>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSink,
) {
    let config = WebSocketConfig {
        max_message_size: Some(settings.max_message_size),
        ..Default::default()
    };

    let stream = match connect_async_with_config(url.as_str(), Some(config), false).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!("WebSocket connect to {} failed: {}", url, e);
            state.set_ready_state(ReadyState::Closed);
            events.emit(TransportEvent::Error(e.to_string()));
            events.emit(TransportEvent::Close(CloseEvent::abnormal(e.to_string())));
            return;
        }
    };

    // close() may have been called while the handshake was in flight
    if state.ready_state() == ReadyState::Connecting {
        state.set_ready_state(ReadyState::Open);
    }
    debug!("WebSocket connected to {}", url);
    events.emit(TransportEvent::Open);

    let (mut sink, mut stream) = stream.split();
    // Set once a close frame is sent; the peer must answer before it.
    let mut close_deadline: Option<Instant> = None;

    let close_event = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Frame(frame)) if close_deadline.is_some() => {
                    state.sub_buffered(frame.len());
                }
                Some(Outgoing::Frame(frame)) => {
                    let len = frame.len();
                    let message = match frame {
                        Frame::Text(text) => Message::Text(text),
                        Frame::Binary(data) => Message::Binary(data.to_vec()),
                    };
                    let result = sink.send(message).await;
                    state.sub_buffered(len);
                    if let Err(e) = result {
                        events.emit(TransportEvent::Error(e.to_string()));
                        break CloseEvent::abnormal(e.to_string());
                    }
                }
                Some(Outgoing::Close(_)) if close_deadline.is_some() => {}
                Some(Outgoing::Close(frame)) => {
                    state.set_ready_state(ReadyState::Closing);
                    close_deadline = Some(Instant::now() + settings.close_timeout);
                    if let Err(e) = sink.send(Message::Close(frame)).await {
                        debug!("Failed to send close frame: {}", e);
                        break CloseEvent::abnormal(e.to_string());
                    }
                }
                None if close_deadline.is_some() => {
                    debug!("Handle dropped during close handshake with {}", url);
                    break CloseEvent::abnormal("closed before the peer answered");
                }
                None => {
                    // Handle dropped: close without waiting for the peer.
                    let _ = sink.close().await;
                    break CloseEvent::new(CLOSE_NORMAL, "", true);
                }
            },
            _ = tokio::time::sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                warn!("Close handshake with {} timed out", url);
                break CloseEvent::abnormal("close handshake timed out");
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    events.emit(TransportEvent::Message(Frame::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    events.emit(TransportEvent::Message(Frame::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Received close frame: {:?}", frame);
                    // Flushes the close reply tungstenite queued.
                    let _ = sink.flush().await;
                    break match frame {
                        Some(frame) => CloseEvent::new(u16::from(frame.code), frame.reason.to_string(), true),
                        None => CloseEvent::new(CLOSE_NO_STATUS, "", true),
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Pongs are queued by tungstenite and flushed on the next read.
                }
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    events.emit(TransportEvent::Error(e.to_string()));
                    break CloseEvent::abnormal(e.to_string());
                }
                None => break CloseEvent::abnormal("connection reset"),
            },
        }
    };

    state.set_ready_state(ReadyState::Closed);
    events.emit(TransportEvent::Close(close_event));
}
