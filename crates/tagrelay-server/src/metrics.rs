//! Prometheus metrics recorder and `/metrics` endpoint handler.
//!
//! Relay-level names live in `tagrelay_relay::metrics`; the constants here
//! cover the socket layer.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if a global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// `WebSocket` sessions opened total (counter).
pub const WS_SESSIONS_TOTAL: &str = "ws_sessions_total";
/// `WebSocket` sessions closed total (counter).
pub const WS_SESSIONS_CLOSED_TOTAL: &str = "ws_sessions_closed_total";
/// Open `WebSocket` sessions (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// `WebSocket` session duration seconds (histogram).
pub const WS_SESSION_DURATION_SECONDS: &str = "ws_session_duration_seconds";
/// Inbound frames total (counter, labels: kind).
pub const WS_FRAMES_RECEIVED_TOTAL: &str = "ws_frames_received_total";
/// Frames rejected as unparseable total (counter).
pub const WS_INVALID_FRAMES_TOTAL: &str = "ws_invalid_frames_total";
/// Handshakes refused total (counter, labels: status).
pub const WS_HANDSHAKE_REJECTS_TOTAL: &str = "ws_handshake_rejects_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_SESSIONS_TOTAL,
            WS_SESSIONS_CLOSED_TOTAL,
            WS_SESSIONS_ACTIVE,
            WS_SESSION_DURATION_SECONDS,
            WS_FRAMES_RECEIVED_TOTAL,
            WS_INVALID_FRAMES_TOTAL,
            WS_HANDSHAKE_REJECTS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
