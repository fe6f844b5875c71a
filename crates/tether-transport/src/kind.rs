//! Transport selection.
//!
//! The socket does not probe for a working transport; the caller names one
//! and gets the matching connector.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::traits::Connector;

/// Built-in transport kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// WebSocket, the default.
    #[default]
    #[serde(alias = "ws")]
    WebSocket,
    /// HTTP long-polling.
    #[serde(alias = "long_poll")]
    LongPoll,
}

impl TransportKind {
    /// Get the transport name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::LongPoll => "longpoll",
        }
    }

    /// Build a connector for this kind.
    ///
    /// Returns `None` if the transport was compiled out.
    #[must_use]
    pub fn connector(self) -> Option<Arc<dyn Connector>> {
        match self {
            #[cfg(feature = "websocket")]
            TransportKind::WebSocket => Some(Arc::new(crate::websocket::WebSocketConnector::new())),
            #[cfg(feature = "longpoll")]
            TransportKind::LongPoll => Some(Arc::new(crate::longpoll::LongPollConnector::new())),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "longpoll" | "long_poll" => Ok(TransportKind::LongPoll),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transport_kind() {
        assert_eq!("websocket".parse::<TransportKind>(), Ok(TransportKind::WebSocket));
        assert_eq!("LongPoll".parse::<TransportKind>(), Ok(TransportKind::LongPoll));
        assert!("sse".parse::<TransportKind>().is_err());
    }

    #[cfg(all(feature = "websocket", feature = "longpoll"))]
    #[test]
    fn test_connector_suffixes() {
        let ws = TransportKind::WebSocket.connector().unwrap();
        let lp = TransportKind::LongPoll.connector().unwrap();
        assert_eq!(ws.endpoint_suffix(), "websocket");
        assert_eq!(lp.endpoint_suffix(), "longpoll");
        assert_eq!(lp.name(), TransportKind::LongPoll.name());
    }
}
