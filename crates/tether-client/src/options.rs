//! Socket configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tether_protocol::{PageContext, PROTOCOL_VERSION};
use tether_transport::{Connector, TransportKind, WebSocketConnector, CLOSE_NORMAL};

use crate::lifecycle::LifecycleSignal;

/// Maps a retry attempt (starting at 1) to the delay before it.
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Optional log sink receiving `(kind, message, data)`.
pub type Logger = Arc<dyn Fn(&str, &str, Option<&Value>) + Send + Sync>;

const RECONNECT_STEPS_MS: [u64; 9] = [10, 50, 100, 150, 200, 250, 500, 1000, 2000];
const RECONNECT_STEADY_MS: u64 = 5000;
const REJOIN_STEPS_MS: [u64; 3] = [1000, 2000, 5000];
const REJOIN_STEADY_MS: u64 = 10_000;

/// Default reconnect schedule: quick retries, then every 5 seconds.
#[must_use]
pub fn default_reconnect_after(tries: u32) -> Duration {
    step(&RECONNECT_STEPS_MS, RECONNECT_STEADY_MS, tries)
}

/// Default rejoin schedule: 1s, 2s, 5s, then every 10 seconds.
#[must_use]
pub fn default_rejoin_after(tries: u32) -> Duration {
    step(&REJOIN_STEPS_MS, REJOIN_STEADY_MS, tries)
}

fn step(steps: &[u64], steady: u64, tries: u32) -> Duration {
    let index = tries.saturating_sub(1) as usize;
    Duration::from_millis(steps.get(index).copied().unwrap_or(steady))
}

/// Connection or join parameters.
///
/// Dynamic params are evaluated each time they are sent, so a token
/// producer can hand out a fresh token on every reconnect.
#[derive(Clone)]
pub enum Params {
    /// A fixed value.
    Static(Value),
    /// A producer called at send time.
    Dynamic(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl Params {
    /// Wrap a producer.
    pub fn dynamic(producer: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Params::Dynamic(Arc::new(producer))
    }

    /// Current value of the params.
    #[must_use]
    pub fn value(&self) -> Value {
        match self {
            Params::Static(value) => value.clone(),
            Params::Dynamic(producer) => producer(),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::Static(Value::Object(Map::new()))
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        Params::Static(value)
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Params::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Params::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Socket options.
///
/// Every field has a default; use the `with_*` methods to override.
pub struct SocketOptions {
    /// Default timeout for pushes and joins.
    pub timeout: Duration,
    /// Interval between heartbeats, also the heartbeat reply deadline.
    pub heartbeat_interval: Duration,
    /// How long a single long-poll request may stay open.
    pub long_poll_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect_after: Backoff,
    /// Rejoin backoff.
    pub rejoin_after: Backoff,
    /// Optional log sink, called in addition to `tracing`.
    pub logger: Option<Logger>,
    /// Connection params, sent as query parameters.
    pub params: Params,
    /// Protocol version announced in the `vsn` query parameter.
    pub vsn: String,
    /// Close code sent when a heartbeat goes unanswered.
    ///
    /// Defaults to 1000. The reconnect after a heartbeat timeout is driven by
    /// the socket marking the close unclean, not by this code, so any code a
    /// server expects (for example 4000) can be used.
    pub heartbeat_close_code: u16,
    /// Transport factory.
    pub connector: Arc<dyn Connector>,
    /// Scheme and host used to resolve relative endpoints.
    pub page: PageContext,
    /// Optional page visibility signal.
    pub lifecycle: Option<LifecycleSignal>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(30_000),
            long_poll_timeout: Duration::from_millis(20_000),
            reconnect_after: Arc::new(default_reconnect_after),
            rejoin_after: Arc::new(default_rejoin_after),
            logger: None,
            params: Params::default(),
            vsn: PROTOCOL_VERSION.to_string(),
            heartbeat_close_code: CLOSE_NORMAL,
            connector: Arc::new(WebSocketConnector::new()),
            page: PageContext::default(),
            lifecycle: None,
        }
    }
}

impl SocketOptions {
    /// Set the default push timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the long-poll request timeout.
    #[must_use]
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Set the reconnect backoff.
    #[must_use]
    pub fn with_reconnect_after(
        mut self,
        backoff: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.reconnect_after = Arc::new(backoff);
        self
    }

    /// Set the rejoin backoff.
    #[must_use]
    pub fn with_rejoin_after(
        mut self,
        backoff: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.rejoin_after = Arc::new(backoff);
        self
    }

    /// Install a log sink.
    #[must_use]
    pub fn with_logger(
        mut self,
        logger: impl Fn(&str, &str, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Set the connection params.
    #[must_use]
    pub fn with_params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    /// Set the protocol version string.
    #[must_use]
    pub fn with_vsn(mut self, vsn: impl Into<String>) -> Self {
        self.vsn = vsn.into();
        self
    }

    /// Set the heartbeat timeout close code.
    #[must_use]
    pub fn with_heartbeat_close_code(mut self, code: u16) -> Self {
        self.heartbeat_close_code = code;
        self
    }

    /// Use a custom transport factory.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Use one of the built-in transports.
    ///
    /// Keeps the current connector if `kind` was compiled out.
    #[must_use]
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        if let Some(connector) = kind.connector() {
            self.connector = connector;
        }
        self
    }

    /// Set the page context used for relative endpoints.
    #[must_use]
    pub fn with_page(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    /// Attach a page visibility signal.
    #[must_use]
    pub fn with_lifecycle(mut self, signal: LifecycleSignal) -> Self {
        self.lifecycle = Some(signal);
        self
    }

    pub(crate) fn log(&self, kind: &str, msg: &str, data: Option<&Value>) {
        if let Some(logger) = &self.logger {
            logger(kind, msg, data);
        }
    }
}

impl fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOptions")
            .field("timeout", &self.timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("long_poll_timeout", &self.long_poll_timeout)
            .field("params", &self.params)
            .field("vsn", &self.vsn)
            .field("heartbeat_close_code", &self.heartbeat_close_code)
            .field("connector", &self.connector.name())
            .field("page", &self.page)
            .finish_non_exhaustive()
    }
}
