//! The relay facade: connections, subscriptions, publishing and acks.
//!
//! Built once at startup and shared as `Arc<Relay>`. [`Relay::drain`]
//! disconnects everything at shutdown.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tagrelay_auth::SharedVerifier;
use tagrelay_core::{
    ConnectionId, Delivery, GapMarker, RawTag, RelayError, SessionId, UserId,
};
use tagrelay_settings::RelaySettings;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{
    Connection, ConnectionHandle, ConnectionManager, ConnectionState, DisconnectReason,
};
use crate::delivery::AckTracker;
use crate::metrics::{
    RELAY_CAPACITY_REJECTS_TOTAL, RELAY_EVENTS_REPLAYED_TOTAL, RELAY_GAP_MARKERS_TOTAL,
    RELAY_VALIDATION_REJECTS_TOTAL,
};
use crate::normalizer::{normalize, validate_session_id};
use crate::queue::OutboundQueue;
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::router::TopicRouter;
use crate::session::Published;
use crate::sweep::{SweepReport, run_sweeper};

/// Relay tuning, derived from [`RelaySettings`].
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Expected client heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Period of the liveness / collection sweep.
    pub sweep_interval: Duration,
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Capacity of each connection's delivery channel.
    pub outbound_buffer: usize,
    /// Session sizing.
    pub registry: RegistryConfig,
}

impl RelayConfig {
    /// Extract the relay's view of the settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let limits = &settings.relay;
        Self {
            heartbeat_interval: limits.heartbeat_interval(),
            sweep_interval: limits.sweep_interval(),
            max_connections: limits.max_connections,
            outbound_buffer: settings.server.outbound_buffer,
            registry: RegistryConfig {
                queue_capacity: limits.queue_capacity,
                retention_events: limits.retention_events,
                retention_window: limits.retention_window(),
                session_grace: limits.session_grace(),
                max_sessions: limits.max_sessions,
            },
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}

/// Result of a subscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeReceipt {
    /// Session subscribed to.
    pub session_id: SessionId,
    /// Watermark the replay started after, if any.
    pub resumed_after: Option<u64>,
    /// Gap marker queued ahead of the replay.
    pub gap: Option<GapMarker>,
    /// Events queued for redelivery.
    pub replayed: usize,
    /// Newest sequence number at subscribe time.
    pub last_seq: u64,
    /// The watermark was ahead of the session, so it was ignored and replay
    /// restarted from the oldest retained event. Clients drop their own
    /// watermark for this session when they see it.
    pub reset: bool,
}

/// The real-time tag relay.
#[derive(Debug)]
pub struct Relay {
    config: RelayConfig,
    connections: ConnectionManager,
    registry: Arc<SessionRegistry>,
    router: TopicRouter,
    acks: AckTracker,
}

impl Relay {
    /// Build a relay that authenticates through `verifier`.
    pub fn new(config: RelayConfig, verifier: SharedVerifier) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.registry.clone()));
        Self {
            connections: ConnectionManager::new(
                verifier,
                config.max_connections,
                config.outbound_buffer,
            ),
            router: TopicRouter::new(Arc::clone(&registry)),
            registry,
            acks: AckTracker::new(),
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Authenticate `token` and open a connection.
    pub async fn connect(&self, token: &str) -> Result<ConnectionHandle, RelayError> {
        self.connections.connect(token).await
    }

    /// Whether a new connection would be refused for capacity.
    pub fn at_capacity(&self) -> bool {
        self.connections.at_capacity()
    }

    /// Record a heartbeat from `id`.
    pub fn heartbeat(&self, id: &ConnectionId) -> Result<ConnectionState, RelayError> {
        self.connections.heartbeat(id)
    }

    /// Close `id` and remove it from every session. Idempotent.
    pub fn disconnect(&self, id: &ConnectionId, reason: DisconnectReason) -> bool {
        let Some(connection) = self.connections.disconnect(id, reason) else {
            return false;
        };
        let now = Instant::now();
        for session_id in connection.take_subscriptions() {
            let _ = self.registry.unsubscribe(id, &session_id, now);
        }
        true
    }

    /// A live connection, marking it alive: any inbound message counts as
    /// a heartbeat.
    fn touch(&self, id: &ConnectionId) -> Result<Arc<Connection>, RelayError> {
        let connection = self.connections.get(id)?;
        let _ = connection.mark_alive(Instant::now());
        Ok(connection)
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Subscribe `id` to `session`, creating the session if needed.
    ///
    /// Replay starts after `last_seq` if the client sent one, otherwise
    /// after the principal's acknowledged watermark. With neither, only
    /// live events are delivered. Subscribing again replaces the previous
    /// subscription.
    pub fn subscribe(
        &self,
        id: &ConnectionId,
        session: &str,
        last_seq: Option<u64>,
    ) -> Result<SubscribeReceipt, RelayError> {
        let connection = self.touch(id)?;
        let session_id = validate_session_id(session)?;
        let resumed_after =
            last_seq.or_else(|| self.acks.last_ack(connection.principal(), &session_id));

        let _ = connection.add_subscription(session_id.clone());
        let now = Instant::now();
        let handle = match self.registry.subscribe(
            id,
            &session_id,
            connection.cancel_token(),
            resumed_after,
            now,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = connection.remove_subscription(&session_id);
                counter!(RELAY_CAPACITY_REJECTS_TOTAL, "resource" => "sessions").increment(1);
                warn!(connection_id = %id, session_id = %session_id, error = %err, "subscribe refused");
                return Err(err.into());
            }
        };

        // Lost a race with disconnect: undo.
        if connection.cancel_token().is_cancelled() {
            let _ = self.registry.unsubscribe(id, &session_id, now);
            return Err(RelayError::NotConnected(id.clone()));
        }

        let _pump = spawn_pump(
            Arc::clone(handle.queue()),
            handle.subscription.cancel_token().clone(),
            connection.sender().clone(),
        );

        if handle.replayed > 0 {
            counter!(RELAY_EVENTS_REPLAYED_TOTAL).increment(handle.replayed as u64);
        }
        if handle.gap.is_some() {
            counter!(RELAY_GAP_MARKERS_TOTAL).increment(1);
        }
        if handle.reset {
            warn!(
                connection_id = %id,
                session_id = %session_id,
                resumed_after,
                last_seq = handle.last_seq,
                "watermark ahead of session, replaying from start"
            );
        }
        info!(
            connection_id = %id,
            principal = %connection.principal(),
            session_id = %session_id,
            resumed_after,
            replayed = handle.replayed,
            gap = handle.gap.is_some(),
            "subscribed"
        );
        Ok(SubscribeReceipt {
            session_id,
            resumed_after,
            gap: handle.gap,
            replayed: handle.replayed,
            last_seq: handle.last_seq,
            reset: handle.reset,
        })
    }

    /// Drop the subscription of `id` to `session`. Returns whether one existed.
    pub fn unsubscribe(&self, id: &ConnectionId, session: &str) -> Result<bool, RelayError> {
        let connection = self.touch(id)?;
        let session_id = validate_session_id(session)?;
        let _ = connection.remove_subscription(&session_id);
        let removed = self.registry.unsubscribe(id, &session_id, Instant::now());
        if removed {
            debug!(connection_id = %id, session_id = %session_id, "unsubscribed");
        }
        Ok(removed)
    }

    // ── Publishing ──────────────────────────────────────────────────

    /// Validate `raw` as published by `id` to `session`, then sequence and
    /// fan it out. Publishing to an unseen session creates it.
    pub fn publish(
        &self,
        id: &ConnectionId,
        session: &str,
        raw: &RawTag,
    ) -> Result<Published, RelayError> {
        let connection = self.touch(id)?;
        let draft = normalize(raw, session, connection.principal()).map_err(|err| {
            counter!(RELAY_VALIDATION_REJECTS_TOTAL).increment(1);
            warn!(
                connection_id = %id,
                principal = %connection.principal(),
                session_id = session,
                error = %err,
                "tag rejected"
            );
            RelayError::from(err)
        })?;
        self.router.route(draft).map_err(|err| {
            counter!(RELAY_CAPACITY_REJECTS_TOTAL, "resource" => "sessions").increment(1);
            warn!(connection_id = %id, session_id = session, error = %err, "publish refused");
            RelayError::from(err)
        })
    }

    /// Record that `id`'s principal has received `session` up to `seq`.
    ///
    /// The watermark is clamped to the session's newest sequence number and
    /// never moves backwards. Returns the watermark after the update.
    pub fn ack(&self, id: &ConnectionId, session: &str, seq: u64) -> Result<u64, RelayError> {
        let connection = self.touch(id)?;
        let session_id = validate_session_id(session)?;
        let principal: &UserId = connection.principal();
        match self.registry.last_sequence(&session_id) {
            Some(last) => Ok(self.acks.ack(principal, &session_id, seq.min(last))),
            None => Ok(self.acks.last_ack(principal, &session_id).unwrap_or(0)),
        }
    }

    /// Acknowledged watermark of `user` for `session`.
    pub fn last_ack(&self, user: &UserId, session: &SessionId) -> Option<u64> {
        self.acks.last_ack(user, session)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Apply heartbeat timeouts and collect idle sessions as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let liveness = self
            .connections
            .sweep(now, self.config.heartbeat_interval);
        for id in &liveness.expired {
            if self.disconnect(id, DisconnectReason::HeartbeatTimeout) {
                warn!(connection_id = %id, "heartbeat timeout");
            }
        }
        let evicted_sessions = self.registry.sweep_idle(now);
        for session_id in &evicted_sessions {
            self.acks.forget_session(session_id);
        }
        SweepReport {
            awaiting: liveness.awaiting,
            disconnected: liveness.expired,
            evicted_sessions,
        }
    }

    /// Run [`sweep`](Self::sweep) periodically until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_sweeper(
            Arc::clone(self),
            self.config.sweep_interval,
            cancel,
        ))
    }

    /// Disconnect every connection and drop every session.
    ///
    /// Returns the number of connections closed.
    pub fn drain(&self) -> usize {
        let ids = self.connections.ids();
        let closed = ids
            .iter()
            .filter(|id| self.disconnect(id, DisconnectReason::Shutdown))
            .count();
        self.registry.clear();
        info!(closed, "relay drained");
        closed
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Live connection by id.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).ok()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    /// Subscribers of `session`.
    pub fn subscriber_count(&self, session: &SessionId) -> usize {
        self.registry.subscriber_count(session)
    }

    /// Newest sequence number of `session`, if it exists.
    pub fn last_sequence(&self, session: &SessionId) -> Option<u64> {
        self.registry.last_sequence(session)
    }
}

/// Forward a subscription's queue into its connection's channel until the
/// subscription is cancelled, the queue closes, or the receiver goes away.
///
/// A stalled receiver only ever blocks this task; the queue keeps absorbing
/// events (shedding the oldest) meanwhile.
fn spawn_pump(
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Delivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = queue.recv() => next,
            };
            let Some(delivery) = next else { break };
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sent = tx.send(delivery) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tagrelay_auth::StaticTokenVerifier;
    use tagrelay_core::{CapacityError, ValidationError};

    fn relay_with(config: RelayConfig) -> Relay {
        let verifier = StaticTokenVerifier::default()
            .with_token("t1", "u1")
            .with_token("t2", "u2");
        Relay::new(config, Arc::new(verifier))
    }

    fn relay() -> Relay {
        relay_with(RelayConfig::default())
    }

    async fn next_seq(rx: &mut mpsc::Receiver<Delivery>) -> (u64, u64) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .seq_range()
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_through_pump() {
        let relay = relay();
        let mut a = relay.connect("t1").await.unwrap();
        let id = a.connection.id().clone();
        let _ = relay.subscribe(&id, "g42", None).unwrap();

        let out = relay.publish(&id, "g42", &RawTag::new("KILL", 1_000, "u1")).unwrap();
        assert_eq!(out.event.seq, 1);
        assert_eq!(out.delivered, 1);
        assert_eq!(next_seq(&mut a.outbound).await, (1, 1));
    }

    #[tokio::test]
    async fn invalid_session_id_rejected() {
        let relay = relay();
        let a = relay.connect("t1").await.unwrap();
        assert_matches!(
            relay.subscribe(a.connection.id(), "bad id", None),
            Err(RelayError::Validation(ValidationError::InvalidSessionId(_)))
        );
        assert_eq!(relay.session_count(), 0);
    }

    #[tokio::test]
    async fn operations_on_unknown_connection_fail() {
        let relay = relay();
        let ghost = ConnectionId::from("ghost");
        assert_matches!(
            relay.subscribe(&ghost, "g42", None),
            Err(RelayError::UnknownConnection(_))
        );
        assert_matches!(
            relay.publish(&ghost, "g42", &RawTag::new("KILL", 1, "u1")),
            Err(RelayError::UnknownConnection(_))
        );
    }

    #[tokio::test]
    async fn disconnect_removes_from_sessions() {
        let relay = relay();
        let a = relay.connect("t1").await.unwrap();
        let id = a.connection.id().clone();
        let _ = relay.subscribe(&id, "g1", None).unwrap();
        let _ = relay.subscribe(&id, "g2", None).unwrap();
        assert!(relay.disconnect(&id, DisconnectReason::ClientClosed));
        assert!(!relay.disconnect(&id, DisconnectReason::ClientClosed));
        assert_eq!(relay.subscriber_count(&"g1".into()), 0);
        assert_eq!(relay.subscriber_count(&"g2".into()), 0);
    }

    #[tokio::test]
    async fn ack_is_clamped_and_monotonic() {
        let relay = relay();
        let a = relay.connect("t1").await.unwrap();
        let id = a.connection.id().clone();
        for _ in 0..3 {
            let _ = relay.publish(&id, "g42", &RawTag::new("KILL", 1, "u1")).unwrap();
        }
        assert_eq!(relay.ack(&id, "g42", 99).unwrap(), 3);
        assert_eq!(relay.ack(&id, "g42", 1).unwrap(), 3);
        assert_eq!(relay.ack(&id, "unseen", 5).unwrap(), 0);
    }

    #[tokio::test]
    async fn acked_watermark_drives_replay() {
        let relay = relay();
        let a = relay.connect("t1").await.unwrap();
        let id = a.connection.id().clone();
        let _ = relay.subscribe(&id, "g42", None).unwrap();
        for _ in 0..4 {
            let _ = relay.publish(&id, "g42", &RawTag::new("DEATH", 1, "u1")).unwrap();
        }
        let _ = relay.ack(&id, "g42", 2).unwrap();
        let _ = relay.disconnect(&id, DisconnectReason::TransportError);

        let mut again = relay.connect("t1").await.unwrap();
        let receipt = relay
            .subscribe(again.connection.id(), "g42", None)
            .unwrap();
        assert_eq!(receipt.resumed_after, Some(2));
        assert_eq!(receipt.replayed, 2);
        assert_eq!(next_seq(&mut again.outbound).await, (3, 3));
        assert_eq!(next_seq(&mut again.outbound).await, (4, 4));
    }

    #[tokio::test]
    async fn session_cap_surfaces_as_capacity_error() {
        let mut config = RelayConfig::default();
        config.registry.max_sessions = 1;
        let relay = relay_with(config);
        let a = relay.connect("t1").await.unwrap();
        let id = a.connection.id().clone();
        let _ = relay.subscribe(&id, "g1", None).unwrap();
        assert_matches!(
            relay.subscribe(&id, "g2", None),
            Err(RelayError::Capacity(CapacityError::Sessions { limit: 1 }))
        );
        assert!(!a.connection.is_subscribed(&"g2".into()));
    }

    #[tokio::test]
    async fn drain_closes_everything() {
        let relay = relay();
        let a = relay.connect("t1").await.unwrap();
        let b = relay.connect("t2").await.unwrap();
        let _ = relay.subscribe(a.connection.id(), "g42", None).unwrap();
        assert_eq!(relay.drain(), 2);
        assert_eq!(relay.connection_count(), 0);
        assert_eq!(relay.session_count(), 0);
        assert!(b.connection.cancel_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions_and_forgets_acks() {
        let relay = relay();
        let a = relay.connect("t1").await.unwrap();
        let id = a.connection.id().clone();
        let _ = relay.publish(&id, "g42", &RawTag::new("KILL", 1, "u1")).unwrap();
        let _ = relay.ack(&id, "g42", 1).unwrap();

        // Keep the connection alive while the retained event and the empty
        // session both age out.
        for _ in 0..151 {
            tokio::time::advance(Duration::from_secs(2)).await;
            let _ = relay.heartbeat(&id).unwrap();
        }
        let report = relay.sweep(Instant::now());
        assert_eq!(report.evicted_sessions, vec![SessionId::from("g42")]);
        assert!(report.disconnected.is_empty());
        assert_eq!(relay.last_ack(&"u1".into(), &"g42".into()), None);
    }
}
