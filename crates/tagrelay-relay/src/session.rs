//! A live game session: sequence counter, retention buffer and subscribers.
//!
//! All mutation happens under one `parking_lot::Mutex` per session, so
//! sequence assignment, retention append and fan-out are serialized for a
//! session while different sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tagrelay_core::{ConnectionId, Delivery, SessionId, TagDraft, TagEvent};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::delivery::{Replay, RetentionBuffer};
use crate::queue::{OutboundQueue, PushOutcome};

/// One connection's subscription to one session.
#[derive(Debug)]
pub struct Subscription {
    connection_id: ConnectionId,
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
}

impl Subscription {
    /// `cancel` should be a child of the owning connection's token.
    pub fn new(connection_id: ConnectionId, queue: Arc<OutboundQueue>, cancel: CancellationToken) -> Self {
        Self {
            connection_id,
            queue,
            cancel,
        }
    }

    /// Owning connection.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The subscriber's outbound queue.
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Cancelled when the subscription or its connection ends.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether fan-out should skip this subscriber.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// End the subscription: stop its pump and discard undelivered entries.
    pub fn close(&self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

/// Returned when an operation reaches a session the sweep already evicted.
/// The caller looks the session up again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Evicted;

/// Outcome of sequencing and fanning out one event.
#[derive(Clone, Debug)]
pub struct Published {
    /// The sequenced event.
    pub event: Arc<TagEvent>,
    /// Subscribers whose queue accepted the event.
    pub delivered: usize,
    /// Pushes that dropped an older entry.
    pub dropped: usize,
    /// Pushes that opened a new gap marker.
    pub new_gaps: usize,
}

/// Outcome of attaching a subscriber.
#[derive(Debug)]
pub(crate) struct Attached {
    pub replay: Replay,
    pub last_seq: u64,
    pub replaced: Option<Arc<Subscription>>,
}

#[derive(Debug)]
struct SessionState {
    next_seq: u64,
    subscribers: HashMap<ConnectionId, Arc<Subscription>>,
    retention: RetentionBuffer,
    empty_since: Option<Instant>,
    evicted: bool,
}

/// A game session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    created_at: Instant,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create an empty session whose first event gets `first_seq`. Its
    /// grace period starts immediately.
    pub fn new(
        id: SessionId,
        first_seq: u64,
        retention_events: usize,
        retention_window: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id,
            created_at: now,
            state: Mutex::new(SessionState {
                next_seq: first_seq.max(1),
                subscribers: HashMap::new(),
                retention: RetentionBuffer::new(retention_events, retention_window),
                empty_since: Some(now),
                evicted: false,
            }),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// When the session was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Newest assigned sequence number (`0` before the first event).
    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Sequence `draft` and enqueue it on every live subscriber.
    pub(crate) fn publish(&self, draft: TagDraft, now: Instant) -> Result<Published, Evicted> {
        let mut state = self.state.lock();
        if state.evicted {
            return Err(Evicted);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let event = Arc::new(draft.sequence(seq));
        state.retention.push(now, Arc::clone(&event));
        if state.subscribers.is_empty() {
            state.empty_since = Some(now);
        }

        let mut out = Published {
            event: Arc::clone(&event),
            delivered: 0,
            dropped: 0,
            new_gaps: 0,
        };
        for sub in state.subscribers.values() {
            if sub.is_cancelled() {
                continue;
            }
            match sub.queue.push(Delivery::Event(Arc::clone(&event))) {
                PushOutcome::Queued => out.delivered += 1,
                PushOutcome::Overflowed { new_gap } => {
                    out.delivered += 1;
                    out.dropped += 1;
                    out.new_gaps += usize::from(new_gap);
                }
                PushOutcome::Closed => {}
            }
        }
        Ok(out)
    }

    /// Add `sub`, first queueing the replay above `after` (if given).
    ///
    /// Replay and registration happen under the session lock, so no live
    /// event can slip in between them.
    pub(crate) fn attach(
        &self,
        sub: Arc<Subscription>,
        after: Option<u64>,
        now: Instant,
    ) -> Result<Attached, Evicted> {
        let mut state = self.state.lock();
        if state.evicted {
            return Err(Evicted);
        }
        let last_seq = state.next_seq - 1;
        let replay = match after {
            Some(after) => state.retention.replay_after(after, last_seq, now),
            None => Replay::default(),
        };
        for delivery in replay.clone().into_deliveries(&self.id) {
            let _ = sub.queue.push(delivery);
        }
        let replaced = state
            .subscribers
            .insert(sub.connection_id.clone(), sub);
        if let Some(old) = &replaced {
            old.close();
        }
        state.empty_since = None;
        Ok(Attached {
            replay,
            last_seq,
            replaced,
        })
    }

    /// Remove the subscription of `connection_id`, closing it.
    pub(crate) fn detach(&self, connection_id: &ConnectionId, now: Instant) -> Option<Arc<Subscription>> {
        let mut state = self.state.lock();
        let removed = state.subscribers.remove(connection_id);
        if let Some(sub) = &removed {
            sub.close();
        }
        if state.subscribers.is_empty() && state.empty_since.is_none() {
            state.empty_since = Some(now);
        }
        removed
    }

    /// Mark the session evicted if it has had neither subscribers nor
    /// publishes for `grace` and has no replayable history left.
    ///
    /// Must be called with the registry's map lock held for writing.
    pub(crate) fn evict_if_idle(&self, now: Instant, grace: Duration) -> bool {
        let mut state = self.state.lock();
        state.retention.prune(now);
        let idle = state.subscribers.is_empty()
            && state.retention.is_empty()
            && state
                .empty_since
                .is_some_and(|since| now.saturating_duration_since(since) >= grace);
        if idle {
            state.evicted = true;
        }
        idle
    }

    /// Close every subscription (shutdown).
    pub(crate) fn close_all(&self) {
        let mut state = self.state.lock();
        for (_, sub) in state.subscribers.drain() {
            sub.close();
        }
        state.evicted = true;
    }
}
