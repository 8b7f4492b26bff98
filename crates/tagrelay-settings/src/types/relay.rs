//! Relay core limits and timings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tagrelay_core::constants::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETENTION_EVENTS,
    DEFAULT_RETENTION_WINDOW, DEFAULT_SESSION_GRACE,
};

/// Timings, queue sizes and caps for the relay core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayLimits {
    /// Expected client heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long an empty session survives before collection, in milliseconds.
    pub session_grace_ms: u64,
    /// Capacity of each subscriber's outbound queue.
    pub queue_capacity: usize,
    /// Events retained per session for replay.
    pub retention_events: usize,
    /// Maximum age of a retained event in milliseconds.
    pub retention_window_ms: u64,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Period of the liveness / collection sweep in milliseconds.
    pub sweep_interval_ms: u64,
}

impl RelayLimits {
    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a connection is disconnected (two missed heartbeats).
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    /// Empty-session grace period.
    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }

    /// Retention window.
    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.retention_window_ms)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for RelayLimits {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            session_grace_ms: DEFAULT_SESSION_GRACE.as_millis() as u64,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retention_events: DEFAULT_RETENTION_EVENTS,
            retention_window_ms: DEFAULT_RETENTION_WINDOW.as_millis() as u64,
            max_sessions: 10_000,
            max_connections: 10_000,
            sweep_interval_ms: 1_000,
        }
    }
}
