//! JSON frame protocol spoken over the `/ws` socket.
//!
//! Frames are `type`-tagged objects with camelCase fields. Destinations
//! follow the `session/{id}` (subscribe) and `session/{id}/tag` (publish)
//! scheme; the legacy `/topic/game/{id}` and `/app/game/{id}/tag` forms
//! are accepted as aliases.

use serde::{Deserialize, Serialize};
use tagrelay_core::{
    ConnectionId, Delivery, GapMarker, RawTag, RelayError, SessionId, TagEvent, UserId,
};
use thiserror::Error;

/// Frame sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Subscribe to a session topic, optionally resuming after `last_seq`.
    Subscribe {
        /// Topic destination.
        destination: String,
        /// Highest sequence number already seen.
        #[serde(default)]
        last_seq: Option<u64>,
    },
    /// Drop a subscription.
    Unsubscribe {
        /// Topic destination.
        destination: String,
    },
    /// Publish a tag.
    Publish {
        /// Publish destination.
        destination: String,
        /// Tag payload.
        body: RawTag,
    },
    /// Acknowledge receipt up to `seq`.
    Ack {
        /// Topic destination.
        destination: String,
        /// Highest sequence number received.
        seq: u64,
    },
    /// Liveness ping.
    Heartbeat,
}

impl ClientFrame {
    /// Frame kind, for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Publish { .. } => "publish",
            Self::Ack { .. } => "ack",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Frame sent by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// First frame on every socket.
    Connected {
        /// Relay-assigned connection id.
        connection_id: ConnectionId,
        /// Authenticated principal.
        principal: UserId,
        /// Expected client heartbeat interval.
        heartbeat_ms: u64,
        /// Delay clients should wait before reconnecting.
        reconnect_delay_ms: u64,
    },
    /// Subscribe receipt.
    Subscribed {
        /// Destination as sent by the client.
        destination: String,
        /// Session subscribed to.
        session_id: SessionId,
        /// Watermark replay started after, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        resumed_after: Option<u64>,
        /// Number of events replayed.
        replayed: usize,
        /// Newest sequence number of the session at subscribe time.
        last_seq: u64,
        /// The client's watermark was ahead of the session and was ignored;
        /// replay started from the oldest retained event.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        reset: bool,
    },
    /// Unsubscribe receipt.
    Unsubscribed {
        /// Destination as sent by the client.
        destination: String,
        /// Whether a subscription existed.
        removed: bool,
    },
    /// A sequenced tag event.
    Event {
        /// `session/{id}`.
        destination: String,
        /// The event.
        event: TagEvent,
    },
    /// Events in the range were not delivered.
    Gap {
        /// `session/{id}`.
        destination: String,
        /// The missing range.
        #[serde(flatten)]
        gap: GapMarker,
    },
    /// Publish receipt.
    Published {
        /// Session published to.
        session_id: SessionId,
        /// Sequence number assigned.
        seq: u64,
        /// Subscribers the event was queued for.
        delivered: usize,
    },
    /// Ack receipt.
    Acked {
        /// Session acknowledged.
        session_id: SessionId,
        /// Watermark after the update.
        seq: u64,
    },
    /// Heartbeat reply.
    Heartbeat,
    /// A request failed.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl ServerFrame {
    /// Wrap a delivery for the wire.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let destination = topic_for(delivery.session_id());
        match delivery {
            Delivery::Event(event) => Self::Event {
                destination,
                event: TagEvent::clone(event),
            },
            Delivery::Gap(gap) => Self::Gap {
                destination,
                gap: gap.clone(),
            },
        }
    }

    /// Error frame for a relay failure.
    pub fn relay_error(err: &RelayError) -> Self {
        Self::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// Error frame for an unusable client frame.
    pub fn frame_error(err: &FrameError) -> Self {
        Self::Error {
            code: FrameError::CODE.to_owned(),
            message: err.to_string(),
        }
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize server frame");
            String::new()
        })
    }
}

/// A client frame that could not be acted on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not valid JSON, or not a known frame shape.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The destination matches no known scheme.
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
}

impl FrameError {
    /// Wire code shared by every frame error.
    pub const CODE: &'static str = "INVALID_FRAME";
}

/// Decode a text frame.
pub fn parse_frame(text: &str) -> Result<ClientFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Session id addressed by a subscribe, unsubscribe or ack destination.
///
/// The returned id is unvalidated; the relay rejects bad ids.
pub fn topic_session(destination: &str) -> Result<&str, FrameError> {
    destination
        .strip_prefix("session/")
        .or_else(|| destination.strip_prefix("/session/"))
        .or_else(|| destination.strip_prefix("/topic/game/"))
        .ok_or_else(|| FrameError::UnknownDestination(destination.to_owned()))
}

/// Session id addressed by a publish destination.
pub fn publish_session(destination: &str) -> Result<&str, FrameError> {
    destination
        .strip_prefix("session/")
        .or_else(|| destination.strip_prefix("/session/"))
        .or_else(|| destination.strip_prefix("/app/game/"))
        .and_then(|rest| rest.strip_suffix("/tag"))
        .ok_or_else(|| FrameError::UnknownDestination(destination.to_owned()))
}

/// Canonical outbound destination of a session.
pub fn topic_for(session_id: &SessionId) -> String {
    format!("session/{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::sync::Arc;
    use tagrelay_core::{TagDraft, TagType, ValidationError};

    #[test]
    fn parses_subscribe_with_and_without_last_seq() {
        let frame = parse_frame(r#"{"type":"subscribe","destination":"session/g42"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                destination: "session/g42".into(),
                last_seq: None
            }
        );
        let frame =
            parse_frame(r#"{"type":"subscribe","destination":"session/g42","lastSeq":7}"#).unwrap();
        assert_matches!(frame, ClientFrame::Subscribe { last_seq: Some(7), .. });
    }

    #[test]
    fn parses_publish_body() {
        let frame = parse_frame(
            r#"{"type":"publish","destination":"session/g42/tag","body":{"type":"KILL","timestamp":1000,"userId":"u1"}}"#,
        )
        .unwrap();
        assert_eq!(frame.kind(), "publish");
        assert_matches!(frame, ClientFrame::Publish { body, .. } if body == RawTag::new("KILL", 1000, "u1"));
    }

    #[test]
    fn parses_ack_and_heartbeat() {
        assert_matches!(
            parse_frame(r#"{"type":"ack","destination":"session/g42","seq":3}"#).unwrap(),
            ClientFrame::Ack { seq: 3, .. }
        );
        assert_eq!(
            parse_frame(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientFrame::Heartbeat
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        for text in [
            "not json",
            r#"{"type":"teleport"}"#,
            r#"{"type":"ack","destination":"session/g42"}"#,
            r#"{"destination":"session/g42"}"#,
        ] {
            assert_matches!(parse_frame(text), Err(FrameError::Malformed(_)), "{text}");
        }
    }

    #[test]
    fn topic_destinations() {
        assert_eq!(topic_session("session/g42").unwrap(), "g42");
        assert_eq!(topic_session("/session/g42").unwrap(), "g42");
        assert_eq!(topic_session("/topic/game/g42").unwrap(), "g42");
        assert_eq!(topic_session("session/").unwrap(), "");
        assert_matches!(
            topic_session("/queue/g42"),
            Err(FrameError::UnknownDestination(_))
        );
    }

    #[test]
    fn publish_destinations() {
        assert_eq!(publish_session("session/g42/tag").unwrap(), "g42");
        assert_eq!(publish_session("/app/game/g42/tag").unwrap(), "g42");
        assert_matches!(
            publish_session("session/g42"),
            Err(FrameError::UnknownDestination(_))
        );
        assert_matches!(
            publish_session("/topic/game/g42/tag"),
            Err(FrameError::UnknownDestination(_))
        );
    }

    #[test]
    fn connected_frame_shape() {
        let frame = ServerFrame::Connected {
            connection_id: "c1".into(),
            principal: "u1".into(),
            heartbeat_ms: 4000,
            reconnect_delay_ms: 5000,
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["connectionId"], "c1");
        assert_eq!(json["principal"], "u1");
        assert_eq!(json["heartbeatMs"], 4000);
        assert_eq!(json["reconnectDelayMs"], 5000);
    }

    #[test]
    fn event_frame_carries_destination_and_seq() {
        let event = TagDraft {
            session_id: "g42".into(),
            tag_type: TagType::Kill,
            user_id: "u1".into(),
            client_timestamp: Some(1000),
            received_at: Utc::now(),
        }
        .sequence(1);
        let frame = ServerFrame::from_delivery(&Delivery::Event(Arc::new(event)));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["destination"], "session/g42");
        assert_eq!(json["event"]["type"], "KILL");
        assert_eq!(json["event"]["seq"], 1);
    }

    #[test]
    fn gap_frame_is_flat() {
        let frame = ServerFrame::from_delivery(&Delivery::Gap(GapMarker {
            session_id: "g42".into(),
            from_seq: 3,
            to_seq: 5,
        }));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "gap");
        assert_eq!(json["sessionId"], "g42");
        assert_eq!(json["fromSeq"], 3);
        assert_eq!(json["toSeq"], 5);
    }

    #[test]
    fn error_frames_use_stable_codes() {
        let err = RelayError::from(ValidationError::UnknownTagType("HEADSHOT".into()));
        let json = serde_json::to_value(ServerFrame::relay_error(&err)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert_eq!(json["message"], "unknown tag type: HEADSHOT");

        let json = serde_json::to_value(ServerFrame::frame_error(&FrameError::Malformed(
            "eof".into(),
        )))
        .unwrap();
        assert_eq!(json["code"], "INVALID_FRAME");
    }

    #[test]
    fn subscribed_omits_missing_watermark() {
        let frame = ServerFrame::Subscribed {
            destination: "session/g42".into(),
            session_id: "g42".into(),
            resumed_after: None,
            replayed: 0,
            last_seq: 0,
            reset: false,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("resumedAfter").is_none());
        assert!(json.get("reset").is_none());
        assert_eq!(json["lastSeq"], 0);
    }

    #[test]
    fn subscribed_flags_reset() {
        let frame = ServerFrame::Subscribed {
            destination: "session/g42".into(),
            session_id: "g42".into(),
            resumed_after: Some(9),
            replayed: 3,
            last_seq: 3,
            reset: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["reset"], true);
        assert_eq!(json["resumedAfter"], 9);
    }
}
