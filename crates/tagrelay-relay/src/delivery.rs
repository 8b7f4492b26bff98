//! Delivery guarantees: replay retention, acknowledgement watermarks and
//! client-side de-duplication.
//!
//! Redelivery is at-least-once. A reconnecting subscriber gets every
//! retained event above its watermark; anything that already fell out of
//! retention is announced with a gap marker first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tagrelay_core::{Delivery, GapMarker, SessionId, TagEvent, UserId};
use tokio::time::Instant;

/// Recent events of one session, bounded by count and by age.
#[derive(Debug)]
pub struct RetentionBuffer {
    events: VecDeque<(Instant, Arc<TagEvent>)>,
    max_events: usize,
    window: Duration,
}

/// Events to redeliver to a reconnecting subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Replay {
    /// Sequence range that is no longer retained, if any.
    pub gap: Option<(u64, u64)>,
    /// Retained events above the watermark, in sequence order.
    pub events: Vec<Arc<TagEvent>>,
    /// The watermark was ahead of the session, so replay restarted from
    /// the beginning of retained history.
    pub reset: bool,
}

impl Replay {
    /// The replay as deliveries: gap marker first, then events.
    pub fn into_deliveries(self, session_id: &SessionId) -> Vec<Delivery> {
        let mut out = Vec::with_capacity(self.events.len() + 1);
        if let Some((from_seq, to_seq)) = self.gap {
            out.push(Delivery::Gap(GapMarker {
                session_id: session_id.clone(),
                from_seq,
                to_seq,
            }));
        }
        out.extend(self.events.into_iter().map(Delivery::Event));
        out
    }

    /// Whether there is nothing to redeliver.
    pub fn is_empty(&self) -> bool {
        self.gap.is_none() && self.events.is_empty()
    }
}

impl RetentionBuffer {
    /// Keep at most `max_events` events no older than `window`.
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(1024)),
            max_events,
            window,
        }
    }

    /// Append a freshly sequenced event.
    pub fn push(&mut self, now: Instant, event: Arc<TagEvent>) {
        self.events.push_back((now, event));
        self.prune(now);
    }

    /// Drop events beyond the count bound or older than the window.
    pub fn prune(&mut self, now: Instant) {
        while self.events.len() > self.max_events {
            let _ = self.events.pop_front();
        }
        while self
            .events
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > self.window)
        {
            let _ = self.events.pop_front();
        }
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Oldest retained sequence number.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.events.front().map(|(_, e)| e.seq)
    }

    /// Everything after `after`, given that `last_seq` is the newest
    /// sequence number the session has assigned.
    ///
    /// A watermark equal to `last_seq` replays nothing. One beyond it
    /// cannot belong to this session's history: replay restarts from zero
    /// and is flagged as a reset.
    pub fn replay_after(&mut self, after: u64, last_seq: u64, now: Instant) -> Replay {
        self.prune(now);
        let reset = after > last_seq;
        let after = if reset { 0 } else { after };
        if after == last_seq {
            return Replay {
                reset,
                ..Replay::default()
            };
        }
        let first_retained = self.oldest_seq().unwrap_or(last_seq + 1);
        let gap = (after + 1 < first_retained).then(|| (after + 1, first_retained - 1));
        let events = self
            .events
            .iter()
            .filter(|(_, e)| e.seq > after)
            .map(|(_, e)| Arc::clone(e))
            .collect();
        Replay { gap, events, reset }
    }
}

/// Highest acknowledged sequence number per principal × session.
///
/// Keyed by principal rather than connection so a reconnect (which gets a
/// new connection id) resumes where the previous connection left off.
#[derive(Debug, Default)]
pub struct AckTracker {
    acks: DashMap<(UserId, SessionId), u64>,
}

impl AckTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` as received. Watermarks never move backwards.
    ///
    /// Returns the watermark after the update.
    pub fn ack(&self, user: &UserId, session: &SessionId, seq: u64) -> u64 {
        let mut entry = self
            .acks
            .entry((user.clone(), session.clone()))
            .or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
        *entry
    }

    /// Current watermark, if the principal ever acknowledged this session.
    pub fn last_ack(&self, user: &UserId, session: &SessionId) -> Option<u64> {
        self.acks
            .get(&(user.clone(), session.clone()))
            .map(|v| *v)
    }

    /// Drop all watermarks for a session that no longer exists.
    pub fn forget_session(&self, session: &SessionId) {
        self.acks.retain(|(_, s), _| s != session);
    }

    /// Number of tracked watermarks.
    pub fn len(&self) -> usize {
        self.acks.len()
    }

    /// Whether no watermark is tracked.
    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }
}

/// Client-side helper: drops redelivered events by sequence number.
///
/// One instance per subscribed session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequenceDeduplicator {
    highest: u64,
}

impl SequenceDeduplicator {
    /// Start with nothing seen.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after `seq` (e.g. the `lastSeq` sent when resubscribing).
    pub fn starting_after(seq: u64) -> Self {
        Self { highest: seq }
    }

    /// Whether `seq` is new. Accepting it advances the watermark.
    pub fn accept(&mut self, seq: u64) -> bool {
        if seq > self.highest {
            self.highest = seq;
            true
        } else {
            false
        }
    }

    /// Whether a delivery carries anything new.
    ///
    /// Gap markers advance the watermark past the lost range.
    pub fn observe(&mut self, delivery: &Delivery) -> bool {
        let (_, to) = delivery.seq_range();
        self.accept(to)
    }

    /// Forget everything seen, after a subscribe receipt reported a reset.
    pub fn reset(&mut self) {
        self.highest = 0;
    }

    /// Highest sequence number seen.
    pub fn highest(&self) -> u64 {
        self.highest
    }
}
