//! Frame dispatch: parses an inbound text frame and applies it to the relay.

use metrics::counter;
use tagrelay_core::{ConnectionId, RelayError};
use tagrelay_relay::Relay;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::protocol::{ClientFrame, FrameError, ServerFrame, parse_frame, publish_session, topic_session};
use crate::metrics::{WS_FRAMES_RECEIVED_TOTAL, WS_INVALID_FRAMES_TOTAL};

#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl DispatchError {
    fn into_frame(self) -> ServerFrame {
        match self {
            Self::Frame(err) => ServerFrame::frame_error(&err),
            Self::Relay(err) => ServerFrame::relay_error(&err),
        }
    }
}

/// Handle one inbound text frame from connection `id`.
///
/// Always produces exactly one reply: a receipt, or an `error` frame.
#[instrument(skip_all, fields(connection_id = %id, kind))]
pub fn handle_message(text: &str, relay: &Relay, id: &ConnectionId) -> ServerFrame {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            counter!(WS_INVALID_FRAMES_TOTAL).increment(1);
            warn!(error = %err, "invalid frame");
            return ServerFrame::frame_error(&err);
        }
    };
    let kind = frame.kind();
    let _ = tracing::Span::current().record("kind", kind);
    counter!(WS_FRAMES_RECEIVED_TOTAL, "kind" => kind).increment(1);

    dispatch(frame, relay, id).unwrap_or_else(|err| {
        debug!(error = %err, "frame failed");
        err.into_frame()
    })
}

fn dispatch(frame: ClientFrame, relay: &Relay, id: &ConnectionId) -> Result<ServerFrame, DispatchError> {
    let reply = match frame {
        ClientFrame::Subscribe {
            destination,
            last_seq,
        } => {
            let receipt = relay.subscribe(id, topic_session(&destination)?, last_seq)?;
            ServerFrame::Subscribed {
                destination,
                session_id: receipt.session_id,
                resumed_after: receipt.resumed_after,
                replayed: receipt.replayed,
                last_seq: receipt.last_seq,
                reset: receipt.reset,
            }
        }
        ClientFrame::Unsubscribe { destination } => {
            let removed = relay.unsubscribe(id, topic_session(&destination)?)?;
            ServerFrame::Unsubscribed {
                destination,
                removed,
            }
        }
        ClientFrame::Publish { destination, body } => {
            let published = relay.publish(id, publish_session(&destination)?, &body)?;
            ServerFrame::Published {
                session_id: published.event.session_id.clone(),
                seq: published.event.seq,
                delivered: published.delivered,
            }
        }
        ClientFrame::Ack { destination, seq } => {
            let session = topic_session(&destination)?;
            let watermark = relay.ack(id, session, seq)?;
            ServerFrame::Acked {
                session_id: session.into(),
                seq: watermark,
            }
        }
        ClientFrame::Heartbeat => {
            let _ = relay.heartbeat(id)?;
            ServerFrame::Heartbeat
        }
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tagrelay_auth::StaticTokenVerifier;
    use tagrelay_relay::{ConnectionHandle, RelayConfig};

    async fn setup() -> (Relay, ConnectionHandle) {
        let verifier = StaticTokenVerifier::default().with_token("t1", "u1");
        let relay = Relay::new(RelayConfig::default(), Arc::new(verifier));
        let handle = relay.connect("t1").await.unwrap();
        (relay, handle)
    }

    fn code(frame: &ServerFrame) -> &str {
        match frame {
            ServerFrame::Error { code, .. } => code,
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_then_publish() {
        let (relay, handle) = setup().await;
        let id = handle.connection.id();

        let reply = handle_message(
            r#"{"type":"subscribe","destination":"session/g42"}"#,
            &relay,
            id,
        );
        assert_matches!(reply, ServerFrame::Subscribed { ref session_id, replayed: 0, last_seq: 0, .. } if session_id.as_str() == "g42");

        let reply = handle_message(
            r#"{"type":"publish","destination":"session/g42/tag","body":{"type":"KILL","timestamp":1000,"userId":"u1"}}"#,
            &relay,
            id,
        );
        assert_matches!(reply, ServerFrame::Published { seq: 1, delivered: 1, .. });
    }

    #[tokio::test]
    async fn legacy_destinations_route_to_same_session() {
        let (relay, handle) = setup().await;
        let id = handle.connection.id();

        let _ = handle_message(r#"{"type":"subscribe","destination":"/topic/game/g7"}"#, &relay, id);
        let reply = handle_message(
            r#"{"type":"publish","destination":"/app/game/g7/tag","body":{"type":"DEATH"}}"#,
            &relay,
            id,
        );
        assert_matches!(reply, ServerFrame::Published { ref session_id, seq: 1, delivered: 1 } if session_id.as_str() == "g7");
    }

    #[tokio::test]
    async fn unknown_tag_is_validation_error() {
        let (relay, handle) = setup().await;
        let reply = handle_message(
            r#"{"type":"publish","destination":"session/g42/tag","body":{"type":"HEADSHOT"}}"#,
            &relay,
            handle.connection.id(),
        );
        assert_eq!(code(&reply), "VALIDATION_ERROR");
        assert_eq!(relay.last_sequence(&"g42".into()), None);
    }

    #[tokio::test]
    async fn bad_frames_are_invalid_frame() {
        let (relay, handle) = setup().await;
        let id = handle.connection.id();
        assert_eq!(code(&handle_message("{", &relay, id)), "INVALID_FRAME");
        assert_eq!(
            code(&handle_message(
                r#"{"type":"subscribe","destination":"/queue/x"}"#,
                &relay,
                id
            )),
            "INVALID_FRAME"
        );
    }

    #[tokio::test]
    async fn ack_reports_clamped_watermark() {
        let (relay, handle) = setup().await;
        let id = handle.connection.id();
        let _ = handle_message(
            r#"{"type":"publish","destination":"session/g42/tag","body":{"type":"KILL"}}"#,
            &relay,
            id,
        );
        let reply = handle_message(r#"{"type":"ack","destination":"session/g42","seq":9}"#, &relay, id);
        assert_matches!(reply, ServerFrame::Acked { seq: 1, .. });
    }

    #[tokio::test]
    async fn unsubscribe_and_heartbeat() {
        let (relay, handle) = setup().await;
        let id = handle.connection.id();
        let _ = handle_message(r#"{"type":"subscribe","destination":"session/g42"}"#, &relay, id);
        assert_matches!(
            handle_message(r#"{"type":"unsubscribe","destination":"session/g42"}"#, &relay, id),
            ServerFrame::Unsubscribed { removed: true, .. }
        );
        assert_matches!(
            handle_message(r#"{"type":"unsubscribe","destination":"session/g42"}"#, &relay, id),
            ServerFrame::Unsubscribed { removed: false, .. }
        );
        assert_eq!(
            handle_message(r#"{"type":"heartbeat"}"#, &relay, id),
            ServerFrame::Heartbeat
        );
    }

    #[tokio::test]
    async fn disconnected_connection_gets_not_connected() {
        let (relay, handle) = setup().await;
        let id = handle.connection.id().clone();
        let _ = relay.disconnect(&id, tagrelay_relay::DisconnectReason::ClientClosed);
        let reply = handle_message(r#"{"type":"heartbeat"}"#, &relay, &id);
        assert_eq!(code(&reply), "UNKNOWN_CONNECTION");
    }
}
