//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format. Each type implements [`Default`] with production values and is
//! marked `#[serde(default)]`, so partial JSON fills in the rest.

mod auth;
mod relay;
mod server;

pub use auth::*;
pub use relay::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the tag relay.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "relay": { "heartbeatIntervalMs": 10000 },
///   "auth": { "jwtSecret": "..." }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Network listener settings.
    pub server: ServerSettings,
    /// Relay core limits and timings.
    pub relay: RelayLimits,
    /// Token verification settings.
    pub auth: AuthSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;
        if relay.queue_capacity < tagrelay_core::constants::MIN_QUEUE_CAPACITY {
            return Err(SettingsError::InvalidValue(format!(
                "relay.queueCapacity must be at least {}",
                tagrelay_core::constants::MIN_QUEUE_CAPACITY
            )));
        }
        if relay.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if relay.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.sweepIntervalMs must be positive".into(),
            ));
        }
        if relay.max_sessions == 0 || relay.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.maxSessions and relay.maxConnections must be positive".into(),
            ));
        }
        if self.server.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundBuffer must be positive".into(),
            ));
        }
        Ok(())
    }
}
