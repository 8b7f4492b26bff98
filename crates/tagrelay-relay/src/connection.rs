//! Client connections and their liveness.
//!
//! The [`ConnectionManager`] owns every [`Connection`]. Sessions refer to a
//! connection only by id and through the subscription's own queue.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tagrelay_auth::SharedVerifier;
use tagrelay_core::{CapacityError, ConnectionId, Delivery, RelayError, SessionId, UserId};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::{
    RELAY_AUTH_FAILURES_TOTAL, RELAY_CAPACITY_REJECTS_TOTAL, RELAY_CONNECTIONS_ACTIVE,
    RELAY_CONNECTIONS_TOTAL, RELAY_DISCONNECTIONS_TOTAL,
};

/// Liveness of a connection.
///
/// `Connecting → Connected ⇄ AwaitingHeartbeat → Disconnected`;
/// `Disconnected` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Authenticated, not yet registered.
    Connecting,
    /// Heard from within one heartbeat interval.
    Connected,
    /// Silent for at least one heartbeat interval.
    AwaitingHeartbeat,
    /// Closed.
    Disconnected,
}

impl ConnectionState {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::AwaitingHeartbeat => "AWAITING_HEARTBEAT",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket.
    ClientClosed,
    /// No heartbeat for two intervals.
    HeartbeatTimeout,
    /// The transport failed.
    TransportError,
    /// The relay is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::TransportError => "transport_error",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
struct Liveness {
    state: ConnectionState,
    last_heartbeat: Instant,
}

/// An authenticated client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    principal: UserId,
    connected_at: Instant,
    liveness: Mutex<Liveness>,
    subscriptions: Mutex<HashSet<SessionId>>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Delivery>,
}

impl Connection {
    fn new(principal: UserId, tx: mpsc::Sender<Delivery>, now: Instant) -> Self {
        Self {
            id: ConnectionId::new(),
            principal,
            connected_at: now,
            liveness: Mutex::new(Liveness {
                state: ConnectionState::Connecting,
                last_heartbeat: now,
            }),
            subscriptions: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            tx,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Authenticated user.
    pub fn principal(&self) -> &UserId {
        &self.principal
    }

    /// When the connection was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Current liveness state.
    pub fn state(&self) -> ConnectionState {
        self.liveness.lock().state
    }

    /// Last time anything was heard from the client.
    pub fn last_heartbeat(&self) -> Instant {
        self.liveness.lock().last_heartbeat
    }

    /// Whether the connection can still subscribe and publish.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
            && matches!(
                self.state(),
                ConnectionState::Connected | ConnectionState::AwaitingHeartbeat
            )
    }

    /// Cancelled on disconnect; subscriptions hold child tokens.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Channel the subscription pumps forward into.
    pub fn sender(&self) -> &mpsc::Sender<Delivery> {
        &self.tx
    }

    /// Sessions this connection is subscribed to.
    pub fn subscriptions(&self) -> Vec<SessionId> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Whether the connection is subscribed to `session_id`.
    pub fn is_subscribed(&self, session_id: &SessionId) -> bool {
        self.subscriptions.lock().contains(session_id)
    }

    pub(crate) fn add_subscription(&self, session_id: SessionId) -> bool {
        self.subscriptions.lock().insert(session_id)
    }

    pub(crate) fn remove_subscription(&self, session_id: &SessionId) -> bool {
        self.subscriptions.lock().remove(session_id)
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<SessionId> {
        self.subscriptions.lock().drain().collect()
    }

    /// Record client activity. `AwaitingHeartbeat` returns to `Connected`.
    ///
    /// Returns the state after the update.
    pub fn mark_alive(&self, now: Instant) -> ConnectionState {
        let mut live = self.liveness.lock();
        if live.state != ConnectionState::Disconnected {
            if live.state == ConnectionState::AwaitingHeartbeat {
                tracing::debug!(connection_id = %self.id, "heartbeat resumed");
            }
            live.state = ConnectionState::Connected;
            live.last_heartbeat = now;
        }
        live.state
    }

    /// Silence since the last heartbeat.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat())
    }

    fn set_awaiting(&self) -> bool {
        let mut live = self.liveness.lock();
        if live.state == ConnectionState::Connected {
            live.state = ConnectionState::AwaitingHeartbeat;
            true
        } else {
            false
        }
    }

    fn close(&self) {
        self.liveness.lock().state = ConnectionState::Disconnected;
        self.cancel.cancel();
    }
}

/// A freshly accepted connection and the receiving end of its deliveries.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// The connection.
    pub connection: Arc<Connection>,
    /// Deliveries for every session the connection subscribes to.
    pub outbound: mpsc::Receiver<Delivery>,
}

/// Liveness transitions found by [`ConnectionManager::sweep`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LivenessSweep {
    /// Connections that just moved to `AwaitingHeartbeat`.
    pub awaiting: Vec<ConnectionId>,
    /// Connections silent for two intervals; the caller disconnects them.
    pub expired: Vec<ConnectionId>,
}

/// Owns connections: authentication, liveness, lookup.
pub struct ConnectionManager {
    verifier: SharedVerifier,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    live: AtomicUsize,
    max_connections: usize,
    outbound_buffer: usize,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager that authenticates through `verifier`.
    pub fn new(verifier: SharedVerifier, max_connections: usize, outbound_buffer: usize) -> Self {
        Self {
            verifier,
            connections: DashMap::new(),
            live: AtomicUsize::new(0),
            max_connections,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    fn reserve_slot(&self) -> Result<(), CapacityError> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| CapacityError::Connections {
                limit: self.max_connections,
            })
    }

    fn release_slot(&self) {
        let _ = self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether a new connection would currently be refused for capacity.
    pub fn at_capacity(&self) -> bool {
        self.live.load(Ordering::Acquire) >= self.max_connections
    }

    /// Authenticate `token` and register a new connection.
    pub async fn connect(&self, token: &str) -> Result<ConnectionHandle, RelayError> {
        if let Err(err) = self.reserve_slot() {
            counter!(RELAY_CAPACITY_REJECTS_TOTAL, "resource" => "connections").increment(1);
            warn!(limit = self.max_connections, "connection refused, at capacity");
            return Err(err.into());
        }
        let principal = match self.verifier.verify(token).await {
            Ok(p) => p,
            Err(err) => {
                self.release_slot();
                counter!(RELAY_AUTH_FAILURES_TOTAL).increment(1);
                warn!(error = %err, "connection refused, authentication failed");
                return Err(err.into());
            }
        };

        let now = Instant::now();
        let (tx, outbound) = mpsc::channel(self.outbound_buffer);
        let connection = Arc::new(Connection::new(principal, tx, now));
        let _ = self
            .connections
            .insert(connection.id().clone(), Arc::clone(&connection));
        let _ = connection.mark_alive(now);

        info!(
            connection_id = %connection.id(),
            principal = %connection.principal(),
            "client connected"
        );
        counter!(RELAY_CONNECTIONS_TOTAL).increment(1);
        gauge!(RELAY_CONNECTIONS_ACTIVE).increment(1.0);
        Ok(ConnectionHandle {
            connection,
            outbound,
        })
    }

    /// Look up a live connection.
    pub fn get(&self, id: &ConnectionId) -> Result<Arc<Connection>, RelayError> {
        let connection = self
            .connections
            .get(id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;
        if connection.is_active() {
            Ok(connection)
        } else {
            Err(RelayError::NotConnected(id.clone()))
        }
    }

    /// Record a heartbeat (or any inbound message).
    pub fn heartbeat(&self, id: &ConnectionId) -> Result<ConnectionState, RelayError> {
        let connection = self.get(id)?;
        Ok(connection.mark_alive(Instant::now()))
    }

    /// Remove and close a connection. Idempotent: returns `None` if it was
    /// already gone.
    pub fn disconnect(&self, id: &ConnectionId, reason: DisconnectReason) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(id)?;
        connection.close();
        self.release_slot();
        info!(
            connection_id = %id,
            principal = %connection.principal(),
            reason = reason.as_str(),
            age_secs = connection.connected_at().elapsed().as_secs(),
            "client disconnected"
        );
        counter!(RELAY_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(RELAY_CONNECTIONS_ACTIVE).decrement(1.0);
        Some(connection)
    }

    /// Apply heartbeat timeouts as of `now`.
    ///
    /// Silence of one `interval` moves a connection to `AwaitingHeartbeat`;
    /// silence of two marks it expired. Works on a snapshot so publishers
    /// are never blocked.
    pub fn sweep(&self, now: Instant, interval: Duration) -> LivenessSweep {
        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut out = LivenessSweep::default();
        for connection in snapshot {
            let silence = connection.silence(now);
            if silence >= interval * 2 {
                out.expired.push(connection.id().clone());
            } else if silence >= interval && connection.set_awaiting() {
                tracing::debug!(
                    connection_id = %connection.id(),
                    silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                    "awaiting heartbeat"
                );
                out.awaiting.push(connection.id().clone());
            }
        }
        out
    }

    /// Ids of every live connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
