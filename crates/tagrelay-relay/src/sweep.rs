//! Periodic liveness and session-collection sweep.

use std::sync::Arc;
use std::time::Duration;

use tagrelay_core::{ConnectionId, SessionId};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::relay::Relay;

/// What one sweep changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections that moved to `AwaitingHeartbeat`.
    pub awaiting: Vec<ConnectionId>,
    /// Connections disconnected for missing two heartbeats.
    pub disconnected: Vec<ConnectionId>,
    /// Idle sessions collected.
    pub evicted_sessions: Vec<SessionId>,
}

impl SweepReport {
    /// Whether the sweep changed nothing.
    pub fn is_empty(&self) -> bool {
        self.awaiting.is_empty() && self.disconnected.is_empty() && self.evicted_sessions.is_empty()
    }
}

/// Sweep `relay` every `interval` until `cancel` fires.
pub async fn run_sweeper(relay: Arc<Relay>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = relay.sweep(Instant::now());
                if !report.is_empty() {
                    debug!(
                        awaiting = report.awaiting.len(),
                        disconnected = report.disconnected.len(),
                        evicted_sessions = report.evicted_sessions.len(),
                        "sweep"
                    );
                }
            }
            () = cancel.cancelled() => {
                debug!("sweeper stopped");
                return;
            }
        }
    }
}
