//! Session registry: the map of live sessions and their subscriber sets.
//!
//! The map is a `parking_lot::RwLock<HashMap>` held only for lookup,
//! insert and eviction, never across delivery. Lock order is always
//! map → session.
//!
//! Evicted sessions leave their last sequence number behind, so a session
//! id recreated later keeps numbering upwards and never reuses a sequence
//! number a client may still hold.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tagrelay_core::{CapacityError, ConnectionId, GapMarker, SessionId, TagDraft};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{
    RELAY_SESSIONS_ACTIVE, RELAY_SESSIONS_CREATED_TOTAL, RELAY_SESSIONS_EVICTED_TOTAL,
};
use crate::queue::OutboundQueue;
use crate::session::{Evicted, Published, Session, Subscription};

/// Sizing and timing of sessions.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Capacity of each subscriber's outbound queue.
    pub queue_capacity: usize,
    /// Events retained per session.
    pub retention_events: usize,
    /// Maximum age of a retained event.
    pub retention_window: Duration,
    /// How long an empty session survives.
    pub session_grace: Duration,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
}

/// A registered subscription plus what was replayed into it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    /// The subscription.
    pub subscription: Arc<Subscription>,
    /// Session subscribed to.
    pub session_id: SessionId,
    /// Gap marker queued ahead of the replay, if history was lost.
    pub gap: Option<GapMarker>,
    /// Number of events queued for redelivery.
    pub replayed: usize,
    /// Newest sequence number at subscribe time.
    pub last_seq: u64,
    /// The watermark was ahead of the session; replay restarted from zero.
    pub reset: bool,
}

impl SubscriptionHandle {
    /// Subscribing connection.
    pub fn connection_id(&self) -> &ConnectionId {
        self.subscription.connection_id()
    }

    /// The subscriber's outbound queue.
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        self.subscription.queue()
    }
}

/// Tracks live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    retired: Mutex<HashMap<SessionId, u64>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Look up a session, creating it if absent.
    fn get_or_create(&self, id: &SessionId, now: Instant) -> Result<Arc<Session>, CapacityError> {
        if let Some(session) = self.sessions.read().get(id) {
            return Ok(Arc::clone(session));
        }
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(id) {
            return Ok(Arc::clone(session));
        }
        if sessions.len() >= self.config.max_sessions {
            return Err(CapacityError::Sessions {
                limit: self.config.max_sessions,
            });
        }
        let first_seq = self.retired.lock().remove(id).map_or(1, |last| last + 1);
        let session = Arc::new(Session::new(
            id.clone(),
            first_seq,
            self.config.retention_events,
            self.config.retention_window,
            now,
        ));
        let _ = sessions.insert(id.clone(), Arc::clone(&session));
        info!(session_id = %id, first_seq, sessions = sessions.len(), "session created");
        counter!(RELAY_SESSIONS_CREATED_TOTAL).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(RELAY_SESSIONS_ACTIVE).set(sessions.len() as f64);
        Ok(session)
    }

    /// Run `op` against the live session `id`, retrying if it raced an
    /// eviction.
    fn with_session<T>(
        &self,
        id: &SessionId,
        now: Instant,
        mut op: impl FnMut(&Session) -> Result<T, Evicted>,
    ) -> Result<T, CapacityError> {
        loop {
            let session = self.get_or_create(id, now)?;
            if let Ok(out) = op(&session) {
                return Ok(out);
            }
        }
    }

    /// Subscribe `connection_id` to `session_id`, creating the session if
    /// needed. Events above `after` still in retention are queued first.
    ///
    /// `cancel` is the connection's token; the subscription gets a child of it.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
        cancel: &CancellationToken,
        after: Option<u64>,
        now: Instant,
    ) -> Result<SubscriptionHandle, CapacityError> {
        let queue = Arc::new(OutboundQueue::new(
            session_id.clone(),
            self.config.queue_capacity,
        ));
        let subscription = Arc::new(Subscription::new(
            connection_id.clone(),
            queue,
            cancel.child_token(),
        ));
        let attached = self.with_session(session_id, now, |session| {
            session.attach(Arc::clone(&subscription), after, now)
        })?;
        let gap = attached.replay.gap.map(|(from_seq, to_seq)| GapMarker {
            session_id: session_id.clone(),
            from_seq,
            to_seq,
        });
        Ok(SubscriptionHandle {
            subscription,
            session_id: session_id.clone(),
            gap,
            replayed: attached.replay.events.len(),
            last_seq: attached.last_seq,
            reset: attached.replay.reset,
        })
    }

    /// Remove a subscription. Returns whether one existed.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, session_id: &SessionId, now: Instant) -> bool {
        let session = self.sessions.read().get(session_id).cloned();
        session.is_some_and(|s| s.detach(connection_id, now).is_some())
    }

    /// Sequence `draft` in its session and fan it out. Creates the session
    /// if it does not exist yet.
    pub fn publish(&self, draft: TagDraft, now: Instant) -> Result<Published, CapacityError> {
        let session_id = draft.session_id.clone();
        self.with_session(&session_id, now, |session| session.publish(draft.clone(), now))
    }

    /// Evict sessions idle for the grace period with no history left,
    /// remembering where their numbering stopped.
    pub fn sweep_idle(&self, now: Instant) -> Vec<SessionId> {
        let mut sessions = self.sessions.write();
        let grace = self.config.session_grace;
        let mut evicted = Vec::new();
        let mut retired = self.retired.lock();
        sessions.retain(|id, session| {
            if session.evict_if_idle(now, grace) {
                let last_seq = session.last_seq();
                if last_seq > 0 {
                    let _ = retired.insert(id.clone(), last_seq);
                }
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            for id in &evicted {
                info!(session_id = %id, "session evicted after grace period");
            }
            counter!(RELAY_SESSIONS_EVICTED_TOTAL).increment(evicted.len() as u64);
            #[allow(clippy::cast_precision_loss)]
            gauge!(RELAY_SESSIONS_ACTIVE).set(sessions.len() as f64);
        }
        evicted
    }

    /// Close every subscription and forget every session.
    pub fn clear(&self) {
        let mut sessions = self.sessions.write();
        for session in sessions.values() {
            session.close_all();
        }
        sessions.clear();
        gauge!(RELAY_SESSIONS_ACTIVE).set(0.0);
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Subscribers of a session (`0` if it does not exist).
    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map_or(0, |s| s.subscriber_count())
    }

    /// Newest sequence number of a session, if it exists.
    pub fn last_sequence(&self, session_id: &SessionId) -> Option<u64> {
        self.sessions.read().get(session_id).map(|s| s.last_seq())
    }

    /// Whether the session exists.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tagrelay_core::{Delivery, TagType};

    fn config() -> RegistryConfig {
        RegistryConfig {
            queue_capacity: 8,
            retention_events: 200,
            retention_window: Duration::from_secs(300),
            session_grace: Duration::from_secs(60),
            max_sessions: 4,
        }
    }

    fn draft(session: &str, tag_type: TagType) -> TagDraft {
        TagDraft {
            session_id: session.into(),
            tag_type,
            user_id: "u1".into(),
            client_timestamp: Some(1_000),
            received_at: chrono::Utc::now(),
        }
    }

    fn seqs(handle: &SubscriptionHandle) -> Vec<u64> {
        std::iter::from_fn(|| handle.queue().try_recv())
            .filter_map(|d| d.as_event().map(|e| e.seq))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_creates_session_lazily() {
        let registry = SessionRegistry::new(config());
        let now = Instant::now();
        assert_eq!(registry.session_count(), 0);
        let handle = registry
            .subscribe(&"c1".into(), &"g42".into(), &CancellationToken::new(), None, now)
            .unwrap();
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.subscriber_count(&"g42".into()), 1);
        assert_eq!(handle.last_seq, 0);
        assert_eq!(handle.replayed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_to_unseen_session_creates_it() {
        let registry = SessionRegistry::new(config());
        let out = registry.publish(draft("g7", TagType::Kill), Instant::now()).unwrap();
        assert_eq!(out.event.seq, 1);
        assert_eq!(out.delivered, 0);
        assert!(registry.contains(&"g7".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_reaches_every_subscriber_in_order() {
        let registry = SessionRegistry::new(config());
        let now = Instant::now();
        let cancel = CancellationToken::new();
        let a = registry.subscribe(&"a".into(), &"g42".into(), &cancel, None, now).unwrap();
        let b = registry.subscribe(&"b".into(), &"g42".into(), &cancel, None, now).unwrap();

        for t in [TagType::Kill, TagType::Death, TagType::Highlight] {
            assert_eq!(registry.publish(draft("g42", t), now).unwrap().delivered, 2);
        }
        assert_eq!(seqs(&a), vec![1, 2, 3]);
        assert_eq!(seqs(&b), vec![1, 2, 3]);
        assert_eq!(registry.last_sequence(&"g42".into()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_independent() {
        let registry = SessionRegistry::new(config());
        let now = Instant::now();
        let a = registry
            .subscribe(&"a".into(), &"g1".into(), &CancellationToken::new(), None, now)
            .unwrap();
        let _ = registry.publish(draft("g2", TagType::Kill), now).unwrap();
        assert_eq!(registry.publish(draft("g1", TagType::Kill), now).unwrap().event.seq, 1);
        assert_eq!(seqs(&a), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_with_watermark_replays() {
        let registry = SessionRegistry::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            let _ = registry.publish(draft("g42", TagType::Kill), now).unwrap();
        }
        let handle = registry
            .subscribe(&"a".into(), &"g42".into(), &CancellationToken::new(), Some(2), now)
            .unwrap();
        assert_eq!(handle.replayed, 3);
        assert!(handle.gap.is_none());
        assert_eq!(handle.last_seq, 5);
        assert_eq!(seqs(&handle), vec![3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_closes_queue() {
        let registry = SessionRegistry::new(config());
        let now = Instant::now();
        let handle = registry
            .subscribe(&"a".into(), &"g42".into(), &CancellationToken::new(), None, now)
            .unwrap();
        assert!(registry.unsubscribe(&"a".into(), &"g42".into(), now));
        assert!(!registry.unsubscribe(&"a".into(), &"g42".into(), now));
        assert!(handle.queue().is_closed());
        assert!(handle.subscription.is_cancelled());
        assert_eq!(registry.subscriber_count(&"g42".into()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_cap_rejects_new_sessions_only() {
        let registry = SessionRegistry::new(RegistryConfig {
            max_sessions: 2,
            ..config()
        });
        let now = Instant::now();
        let _ = registry.publish(draft("g1", TagType::Kill), now).unwrap();
        let _ = registry.publish(draft("g2", TagType::Kill), now).unwrap();
        assert_matches!(
            registry.publish(draft("g3", TagType::Kill), now),
            Err(CapacityError::Sessions { limit: 2 })
        );
        assert!(registry.publish(draft("g1", TagType::Death), now).is_ok());
        assert_eq!(registry.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_collected_after_grace() {
        let registry = SessionRegistry::new(config());
        let start = Instant::now();
        let _ = registry
            .subscribe(&"a".into(), &"busy".into(), &CancellationToken::new(), None, start)
            .unwrap();
        let _ = registry.publish(draft("idle", TagType::Kill), start).unwrap();

        assert!(registry.sweep_idle(start + Duration::from_secs(30)).is_empty());
        // Still holding replayable history.
        assert!(registry.sweep_idle(start + Duration::from_secs(61)).is_empty());
        let evicted = registry.sweep_idle(start + Duration::from_secs(301));
        assert_eq!(evicted, vec![SessionId::from("idle")]);
        assert!(registry.contains(&"busy".into()));

        // A recreated session continues numbering.
        let out = registry
            .publish(draft("idle", TagType::Kill), start + Duration::from_secs(302))
            .unwrap();
        assert_eq!(out.event.seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_cancel_silences_subscription() {
        let registry = SessionRegistry::new(config());
        let now = Instant::now();
        let conn = CancellationToken::new();
        let handle = registry.subscribe(&"a".into(), &"g42".into(), &conn, None, now).unwrap();
        conn.cancel();
        assert_eq!(registry.publish(draft("g42", TagType::Kill), now).unwrap().delivered, 0);
        assert!(handle.queue().try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_reports_gap() {
        let registry = SessionRegistry::new(RegistryConfig {
            queue_capacity: 2,
            ..config()
        });
        let now = Instant::now();
        let handle = registry
            .subscribe(&"a".into(), &"g42".into(), &CancellationToken::new(), None, now)
            .unwrap();
        let mut new_gaps = 0;
        for _ in 0..4 {
            new_gaps += registry.publish(draft("g42", TagType::Kill), now).unwrap().new_gaps;
        }
        assert_eq!(new_gaps, 1);
        assert_matches!(
            handle.queue().try_recv(),
            Some(Delivery::Gap(g)) if g.from_seq == 1 && g.to_seq == 2
        );
    }
}
