//! Topic router: sequences validated drafts and fans them out.

use std::sync::Arc;

use metrics::counter;
use tagrelay_core::{CapacityError, TagDraft};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::{
    RELAY_EVENTS_DROPPED_TOTAL, RELAY_EVENTS_ROUTED_TOTAL, RELAY_GAP_MARKERS_TOTAL,
};
use crate::registry::SessionRegistry;
use crate::session::Published;

/// Routes drafts to their session's subscribers.
#[derive(Clone, Debug)]
pub struct TopicRouter {
    registry: Arc<SessionRegistry>,
}

impl TopicRouter {
    /// Router over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Sequence `draft` and enqueue it for every subscriber of its session.
    ///
    /// Never blocks on a subscriber: a full queue sheds its oldest entry.
    pub fn route(&self, draft: TagDraft) -> Result<Published, CapacityError> {
        let tag_type = draft.tag_type;
        let out = self.registry.publish(draft, Instant::now())?;
        counter!(RELAY_EVENTS_ROUTED_TOTAL, "type" => tag_type.as_str()).increment(1);
        if out.dropped > 0 {
            counter!(RELAY_EVENTS_DROPPED_TOTAL).increment(out.dropped as u64);
            counter!(RELAY_GAP_MARKERS_TOTAL).increment(out.new_gaps as u64);
            warn!(
                session_id = %out.event.session_id,
                seq = out.event.seq,
                dropped = out.dropped,
                "subscriber queue overflow, oldest entries replaced by gap marker"
            );
        }
        debug!(
            session_id = %out.event.session_id,
            seq = out.event.seq,
            tag_type = %tag_type,
            user_id = %out.event.user_id,
            delivered = out.delivered,
            "routed tag event"
        );
        Ok(out)
    }

    /// The registry this router publishes into.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
