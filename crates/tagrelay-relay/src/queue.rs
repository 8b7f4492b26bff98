//! Bounded per-subscriber outbound queue.
//!
//! Pushing never blocks. When the queue is full the oldest undelivered entry
//! is dropped and folded into a pending gap marker, which is handed out
//! before anything still queued. Consecutive drops extend the same marker
//! until the consumer takes it.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tagrelay_core::{Delivery, GapMarker, SessionId};
use tokio::sync::Notify;

/// Result of [`OutboundQueue::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after dropping the oldest entry.
    Overflowed {
        /// The drop opened a new gap marker rather than extending one.
        new_gap: bool,
    },
    /// The queue is closed; the entry was discarded.
    Closed,
}

impl PushOutcome {
    /// Whether the entry was accepted.
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Delivery>,
    pending_gap: Option<(u64, u64)>,
    closed: bool,
    dropped: u64,
}

/// Single-consumer bounded queue of [`Delivery`] values for one session.
#[derive(Debug)]
pub struct OutboundQueue {
    session_id: SessionId,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    /// Create an empty queue holding at most `capacity` entries.
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        Self {
            session_id,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Session this queue delivers for.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Enqueue without blocking, dropping the oldest entry on overflow.
    pub fn push(&self, item: Delivery) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let mut outcome = PushOutcome::Queued;
            if state.items.len() >= self.capacity {
                if let Some(oldest) = state.items.pop_front() {
                    let (from, to) = oldest.seq_range();
                    let new_gap = state.pending_gap.is_none();
                    state.pending_gap = Some(match state.pending_gap {
                        Some((f, t)) => (f.min(from), t.max(to)),
                        None => (from, to),
                    });
                    if oldest.as_event().is_some() {
                        state.dropped += 1;
                    }
                    outcome = PushOutcome::Overflowed { new_gap };
                }
            }
            state.items.push_back(item);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Take the next entry if one is ready.
    pub fn try_recv(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        if let Some((from_seq, to_seq)) = state.pending_gap.take() {
            return Some(Delivery::Gap(GapMarker {
                session_id: self.session_id.clone(),
                from_seq,
                to_seq,
            }));
        }
        state.items.pop_front()
    }

    /// Wait for the next entry. Returns `None` once the queue is closed.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue, discarding anything undelivered.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
            state.pending_gap = None;
        }
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Entries currently queued (a pending gap counts as one).
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.items.len() + usize::from(state.pending_gap.is_some())
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped on overflow over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
