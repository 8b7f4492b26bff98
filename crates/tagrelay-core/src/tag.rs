//! Tag event types: the wire payload, the validated draft, and the sequenced event.
//!
//! A tag moves through three stages:
//!
//! 1. [`RawTag`]: exactly what the client sent (`{type, timestamp, userId}`),
//!    every field optional so that malformed input surfaces as a
//!    [`ValidationError`] rather than a decode failure
//! 2. [`TagDraft`]: validated and stamped with the server receipt time
//! 3. [`TagEvent`]: sequenced by its session and shared as `Arc<TagEvent>`;
//!    never mutated afterwards
//!
//! Subscribers receive [`Delivery`] values: either an event or a
//! [`GapMarker`] standing in for events dropped on queue overflow.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::{SessionId, UserId};

/// The enumerated tag kinds a client may publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagType {
    /// The tagging player scored a kill.
    Kill,
    /// The tagging player died.
    Death,
    /// A moment worth revisiting in the VOD.
    Highlight,
}

impl TagType {
    /// Every accepted tag type.
    pub const ALL: [Self; 3] = [Self::Kill, Self::Death, Self::Highlight];

    /// Wire name of the tag type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kill => "KILL",
            Self::Death => "DEATH",
            Self::Highlight => "HIGHLIGHT",
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownTagType(s.to_owned()))
    }
}

/// Tag payload as published by a client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTag {
    /// Tag type name (`KILL`, `DEATH`, `HIGHLIGHT`).
    #[serde(rename = "type", default)]
    pub tag_type: Option<String>,
    /// Client clock at the moment of tagging, epoch millis.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Author as claimed by the client.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl RawTag {
    /// Build a payload with every field present.
    #[must_use]
    pub fn new(tag_type: &str, timestamp: i64, user_id: &str) -> Self {
        Self {
            tag_type: Some(tag_type.to_owned()),
            timestamp: Some(timestamp),
            user_id: Some(user_id.to_owned()),
        }
    }
}

/// A validated tag that has not yet been assigned a sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagDraft {
    /// Session the tag belongs to.
    pub session_id: SessionId,
    /// Tag kind.
    pub tag_type: TagType,
    /// Authenticated author.
    pub user_id: UserId,
    /// Advisory client timestamp (epoch millis).
    pub client_timestamp: Option<i64>,
    /// Authoritative server receipt time.
    pub received_at: DateTime<Utc>,
}

impl TagDraft {
    /// Freeze the draft into an immutable event with its session sequence number.
    #[must_use]
    pub fn sequence(self, seq: u64) -> TagEvent {
        TagEvent {
            session_id: self.session_id,
            tag_type: self.tag_type,
            user_id: self.user_id,
            client_timestamp: self.client_timestamp,
            received_at: self.received_at,
            seq,
        }
    }
}

/// A sequenced tag event, as delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    /// Session the tag belongs to.
    pub session_id: SessionId,
    /// Tag kind.
    #[serde(rename = "type")]
    pub tag_type: TagType,
    /// Authenticated author.
    pub user_id: UserId,
    /// Advisory client timestamp (epoch millis).
    #[serde(rename = "timestamp", skip_serializing_if = "Option::is_none", default)]
    pub client_timestamp: Option<i64>,
    /// Authoritative server receipt time.
    pub received_at: DateTime<Utc>,
    /// Per-session sequence number, strictly increasing from 1.
    pub seq: u64,
}

/// Inclusive range of sequence numbers a subscriber did not receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapMarker {
    /// Session the gap belongs to.
    pub session_id: SessionId,
    /// First missing sequence number.
    pub from_seq: u64,
    /// Last missing sequence number.
    pub to_seq: u64,
}

impl GapMarker {
    /// Number of sequence numbers covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.to_seq - self.from_seq + 1
    }

    /// Gap markers always cover at least one sequence number.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// What a subscriber receives from a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A sequenced tag event.
    Event(Arc<TagEvent>),
    /// Events in this range were dropped and must be reconciled.
    Gap(GapMarker),
}

impl Delivery {
    /// Session this delivery belongs to.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Event(e) => &e.session_id,
            Self::Gap(g) => &g.session_id,
        }
    }

    /// Inclusive sequence range covered by this delivery.
    #[must_use]
    pub fn seq_range(&self) -> (u64, u64) {
        match self {
            Self::Event(e) => (e.seq, e.seq),
            Self::Gap(g) => (g.from_seq, g.to_seq),
        }
    }

    /// The event, if this is not a gap.
    #[must_use]
    pub fn as_event(&self) -> Option<&TagEvent> {
        match self {
            Self::Event(e) => Some(e),
            Self::Gap(_) => None,
        }
    }
}
