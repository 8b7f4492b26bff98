//! Metric names emitted by the relay core.
//!
//! Recording goes through the `metrics` facade; the binary installs the
//! Prometheus recorder.

/// Connections accepted (counter).
pub const RELAY_CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connections closed (counter, labels: reason).
pub const RELAY_DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Live connections (gauge).
pub const RELAY_CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Handshakes refused by token verification (counter).
pub const RELAY_AUTH_FAILURES_TOTAL: &str = "relay_auth_failures_total";
/// Work refused by a capacity cap (counter, labels: resource).
pub const RELAY_CAPACITY_REJECTS_TOTAL: &str = "relay_capacity_rejects_total";
/// Live sessions (gauge).
pub const RELAY_SESSIONS_ACTIVE: &str = "relay_sessions_active";
/// Sessions created (counter).
pub const RELAY_SESSIONS_CREATED_TOTAL: &str = "relay_sessions_created_total";
/// Sessions collected after the grace period (counter).
pub const RELAY_SESSIONS_EVICTED_TOTAL: &str = "relay_sessions_evicted_total";
/// Events sequenced and fanned out (counter, labels: type).
pub const RELAY_EVENTS_ROUTED_TOTAL: &str = "relay_events_routed_total";
/// Events dropped from a full subscriber queue (counter).
pub const RELAY_EVENTS_DROPPED_TOTAL: &str = "relay_events_dropped_total";
/// Gap markers opened on overflow or replay (counter).
pub const RELAY_GAP_MARKERS_TOTAL: &str = "relay_gap_markers_total";
/// Events redelivered on resubscribe (counter).
pub const RELAY_EVENTS_REPLAYED_TOTAL: &str = "relay_events_replayed_total";
/// Tag payloads rejected by validation (counter).
pub const RELAY_VALIDATION_REJECTS_TOTAL: &str = "relay_validation_rejects_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            RELAY_CONNECTIONS_TOTAL,
            RELAY_DISCONNECTIONS_TOTAL,
            RELAY_CONNECTIONS_ACTIVE,
            RELAY_AUTH_FAILURES_TOTAL,
            RELAY_CAPACITY_REJECTS_TOTAL,
            RELAY_SESSIONS_ACTIVE,
            RELAY_SESSIONS_CREATED_TOTAL,
            RELAY_SESSIONS_EVICTED_TOTAL,
            RELAY_EVENTS_ROUTED_TOTAL,
            RELAY_EVENTS_DROPPED_TOTAL,
            RELAY_GAP_MARKERS_TOTAL,
            RELAY_EVENTS_REPLAYED_TOTAL,
            RELAY_VALIDATION_REJECTS_TOTAL,
        ];
        for name in names {
            assert!(
                name.starts_with("relay_")
                    && name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case with the relay_ prefix"
            );
        }
    }
}
