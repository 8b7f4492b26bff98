//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Order matters: the token stops the listener and the sweeper first, the
//! relay is drained (which closes every socket with a Close frame), then
//! the tracked tasks get a bounded time to finish.

use std::time::Duration;

use tagrelay_relay::Relay;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of [`ShutdownCoordinator::graceful_shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections closed by the relay drain.
    pub closed_connections: usize,
    /// Whether some tasks were still running when the timeout fired.
    pub timed_out: bool,
}

/// Coordinates shutdown of the listener, the sweeper and open sockets.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A clone of the cancellation token, for tasks to watch.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token, drain `relay`, then wait up to `timeout` for `handles`.
    pub async fn graceful_shutdown(
        &self,
        relay: &Relay,
        handles: Vec<JoinHandle<()>>,
        timeout: Duration,
    ) -> ShutdownReport {
        self.shutdown();
        let closed_connections = relay.drain();
        info!(
            closed_connections,
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let timed_out = tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err();
        if timed_out {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
        ShutdownReport {
            closed_connections,
            timed_out,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
