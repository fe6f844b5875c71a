//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TETHER_*)
//! - TOML configuration file

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_client::{SocketOptions, TransportKind};

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Socket endpoint, e.g. `ws://127.0.0.1:4000/socket`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Transport to connect with.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Socket timings.
    #[serde(default)]
    pub socket: SocketConfig,

    /// Connection params sent as query parameters.
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Topics to join after connecting.
    #[serde(default)]
    pub topics: Vec<TopicConfig>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Socket timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Push timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Long-poll request timeout in milliseconds.
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout_ms: u64,

    /// Close code used when a heartbeat goes unanswered.
    #[serde(default = "default_heartbeat_close_code")]
    pub heartbeat_close_code: u16,
}

/// A topic to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic name, e.g. `room:lobby`.
    pub name: String,

    /// Join params.
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Track presence on this topic.
    #[serde(default)]
    pub presence: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_endpoint() -> String {
    std::env::var("TETHER_ENDPOINT").unwrap_or_else(|_| "ws://127.0.0.1:4000/socket".to_string())
}

fn default_transport() -> TransportKind {
    std::env::var("TETHER_TRANSPORT")
        .ok()
        .and_then(|t| t.parse().ok())
        .unwrap_or_default()
}

fn default_timeout() -> u64 {
    10_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_long_poll_timeout() -> u64 {
    20_000
}

fn default_heartbeat_close_code() -> u16 {
    1000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            transport: default_transport(),
            socket: SocketConfig::default(),
            params: Map::new(),
            topics: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            long_poll_timeout_ms: default_long_poll_timeout(),
            heartbeat_close_code: default_heartbeat_close_code(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Build socket options from this configuration.
    #[must_use]
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions::default()
            .with_transport(self.transport)
            .with_timeout(Duration::from_millis(self.socket.timeout_ms))
            .with_heartbeat_interval(Duration::from_millis(self.socket.heartbeat_interval_ms))
            .with_long_poll_timeout(Duration::from_millis(self.socket.long_poll_timeout_ms))
            .with_heartbeat_close_code(self.socket.heartbeat_close_code)
            .with_params(Value::Object(self.params.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.socket.timeout_ms, 10_000);
        assert_eq!(config.socket.heartbeat_interval_ms, 30_000);
        assert!(config.topics.is_empty());
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            endpoint = "wss://example.com/socket"
            transport = "longpoll"

            [params]
            token = "abc"

            [socket]
            heartbeat_interval_ms = 5000

            [[topics]]
            name = "room:lobby"
            presence = true

            [[topics]]
            name = "room:ops"
            params = { role = "admin" }
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.endpoint, "wss://example.com/socket");
        assert_eq!(config.transport, TransportKind::LongPoll);
        assert_eq!(config.params["token"], "abc");
        assert_eq!(config.socket.heartbeat_interval_ms, 5000);
        assert_eq!(config.socket.timeout_ms, 10_000);
        assert_eq!(config.topics.len(), 2);
        assert!(config.topics[0].presence);
        assert_eq!(config.topics[1].params["role"], "admin");
    }

    #[test]
    fn test_socket_options() {
        let toml_str = r#"
            [socket]
            timeout_ms = 2500
            heartbeat_close_code = 4000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        let options = config.socket_options();
        assert_eq!(options.timeout, Duration::from_millis(2500));
        assert_eq!(options.heartbeat_close_code, 4000);
    }
}
