//! HTTP long-poll transport implementation.
//!
//! Emulates a duplex connection over plain HTTP: a background task keeps one
//! `GET` outstanding to receive batches of messages, and outbound frames are
//! `POST`ed one at a time in order. The server hands out a session token in
//! every poll response which is echoed on subsequent requests.
//!
//! Poll responses are JSON objects `{"status", "token", "messages"}` where
//! the status drives the session:
//!
//! | status | meaning                                   |
//! |--------|-------------------------------------------|
//! | 200    | messages delivered, poll again            |
//! | 204    | poll timed out on the server, poll again  |
//! | 410    | new session; the transport is now open    |
//! | 403    | forbidden; close with 1008                |
//! | 500    | server failure; close with 1011           |

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tether_protocol::Frame;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::traits::{
    CloseEvent, ConnectOptions, Connector, EventSink, ReadyState, SharedState, Transport,
    TransportError, TransportEvent, CLOSE_NORMAL, CLOSE_NO_STATUS,
};

/// Close code used when the server refuses the session.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code used when the server fails.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: u16,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
}

/// Opens long-poll sessions.
#[derive(Debug, Clone, Default)]
pub struct LongPollConnector {
    client: reqwest::Client,
}

impl LongPollConnector {
    /// Create a connector with a default HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector that reuses an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Connector for LongPollConnector {
    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Box<dyn Transport> {
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Session {
            client: self.client.clone(),
            endpoint: http_endpoint(url),
            poll_timeout: options.long_poll_timeout,
            token: Mutex::new(None),
            state: SharedState::new(ReadyState::Connecting),
            events,
            closed,
        });

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_loop(session.clone()));
        tokio::spawn(send_loop(session.clone(), outgoing_rx));

        Box::new(LongPollTransport {
            session,
            outgoing: outgoing_tx,
        })
    }

    fn name(&self) -> &'static str {
        "longpoll"
    }

    fn endpoint_suffix(&self) -> &'static str {
        "longpoll"
    }
}

/// Swap a WebSocket scheme for the matching HTTP scheme.
#[must_use]
pub fn http_endpoint(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}

struct Session {
    client: reqwest::Client,
    endpoint: String,
    poll_timeout: Duration,
    token: Mutex<Option<String>>,
    state: SharedState,
    events: EventSink,
    closed: watch::Sender<bool>,
}

impl Session {
    fn request(&self, method: Method) -> RequestBuilder {
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let request = self
            .client
            .request(method, &self.endpoint)
            .header(CONTENT_TYPE, "application/json");
        match token {
            Some(token) => request.query(&[("token", token)]),
            None => request,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop both loops and report the close, once.
    fn finish(&self, event: CloseEvent) {
        if self.closed.send_replace(true) {
            return;
        }
        self.state.set_ready_state(ReadyState::Closed);
        self.events.emit(TransportEvent::Close(event));
    }

    fn fail(&self, error: impl Into<String>, close: CloseEvent) {
        if self.is_closed() {
            return;
        }
        self.events.emit(TransportEvent::Error(error.into()));
        self.finish(close);
    }
}

async fn poll_loop(session: Arc<Session>) {
    let mut closed = session.closed.subscribe();

    loop {
        if session.is_closed() {
            return;
        }

        let request = session
            .request(Method::GET)
            .timeout(session.poll_timeout)
            .send();

        let response = tokio::select! {
            _ = closed.changed() => {
                debug!("long-poll loop cancelled");
                return;
            }
            response = request => response,
        };

        let poll = match response {
            Ok(response) => match response.json::<PollResponse>().await {
                Ok(poll) => Some(poll),
                Err(e) => {
                    warn!("invalid long-poll response: {}", e);
                    None
                }
            },
            Err(e) if e.is_timeout() => {
                session.fail(
                    "timeout",
                    CloseEvent::new(CLOSE_NO_STATUS, "timeout", false),
                );
                return;
            }
            Err(e) => {
                warn!("long-poll request error: {}", e);
                None
            }
        };

        if session.is_closed() {
            return;
        }

        let status = poll.as_ref().map_or(0, |poll| poll.status);
        if let Some(poll) = &poll {
            *session.token.lock().unwrap_or_else(PoisonError::into_inner) = poll.token.clone();
        }

        match status {
            200 => {
                for message in poll.map(|poll| poll.messages).unwrap_or_default() {
                    session
                        .events
                        .emit(TransportEvent::Message(Frame::Text(message)));
                }
            }
            204 => {}
            410 => {
                session.state.set_ready_state(ReadyState::Open);
                session.events.emit(TransportEvent::Open);
            }
            403 => {
                session.fail(
                    "forbidden",
                    CloseEvent::new(CLOSE_POLICY_VIOLATION, "forbidden", false),
                );
                return;
            }
            0 | 500 => {
                session.fail(
                    "internal server error",
                    CloseEvent::new(CLOSE_INTERNAL_ERROR, "internal server error", false),
                );
                return;
            }
            other => {
                session.fail(
                    format!("unhandled poll status {other}"),
                    CloseEvent::new(CLOSE_INTERNAL_ERROR, "internal server error", false),
                );
                return;
            }
        }
    }
}

async fn send_loop(session: Arc<Session>, mut outgoing: mpsc::UnboundedReceiver<String>) {
    let mut closed = session.closed.subscribe();

    loop {
        let body = tokio::select! {
            _ = closed.changed() => {
                debug!("long-poll send loop cancelled");
                return;
            }
            body = outgoing.recv() => match body {
                Some(body) => body,
                None => return,
            },
        };

        let len = body.len();
        let result = session.request(Method::POST).body(body).send().await;
        session.state.sub_buffered(len);

        match result {
            Ok(response) if response.status() == StatusCode::OK => {}
            Ok(response) => {
                warn!("long-poll send returned status {}", response.status());
                session.fail(
                    format!("send returned status {}", response.status().as_u16()),
                    CloseEvent::new(CLOSE_INTERNAL_ERROR, "internal server error", false),
                );
                return;
            }
            Err(e) => {
                warn!("long-poll send error: {}", e);
                session.fail(
                    e.to_string(),
                    CloseEvent::new(CLOSE_INTERNAL_ERROR, "internal server error", false),
                );
                return;
            }
        }
    }
}

/// Handle to a long-poll session.
///
/// Dropping the handle stops the session without reporting a close.
pub struct LongPollTransport {
    session: Arc<Session>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl Transport for LongPollTransport {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.session.state.ready_state() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        let Frame::Text(body) = frame else {
            return Err(TransportError::Unsupported("binary frames over long-poll"));
        };
        let len = body.len();
        self.session.state.add_buffered(len);
        self.outgoing.send(body).map_err(|_| {
            self.session.state.sub_buffered(len);
            TransportError::ConnectionClosed
        })
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) {
        self.session.finish(CloseEvent::new(
            code.unwrap_or(CLOSE_NORMAL),
            reason.unwrap_or_default(),
            true,
        ));
    }

    fn ready_state(&self) -> ReadyState {
        self.session.state.ready_state()
    }

    fn buffered_amount(&self) -> usize {
        self.session.state.buffered()
    }

    fn skip_heartbeat(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "longpoll"
    }
}

impl Drop for LongPollTransport {
    fn drop(&mut self) {
        if !self.session.closed.send_replace(true) {
            self.session.state.set_ready_state(ReadyState::Closed);
        }
    }
}
