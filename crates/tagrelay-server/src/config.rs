//! Server configuration.

use std::time::Duration;

use tagrelay_core::constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_DELAY};
use tagrelay_settings::RelaySettings;

/// Transport settings, derived from [`RelaySettings`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Interval between server Ping frames; also advertised to clients.
    pub heartbeat_interval: Duration,
    /// Reconnect delay advertised in the `connected` frame.
    pub reconnect_delay: Duration,
    /// How long shutdown waits for connections to drain.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// Extract the transport's view of the settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            heartbeat_interval: settings.relay.heartbeat_interval(),
            reconnect_delay: Duration::from_millis(settings.server.reconnect_delay_ms),
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
        }
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 64 * 1024,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}
