//! `WebSocket` session lifecycle: one authenticated client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tagrelay_relay::{ConnectionHandle, DisconnectReason, Relay};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::handler::handle_message;
use super::protocol::ServerFrame;
use crate::config::ServerConfig;
use crate::metrics::{
    WS_SESSION_DURATION_SECONDS, WS_SESSIONS_ACTIVE, WS_SESSIONS_CLOSED_TOTAL, WS_SESSIONS_TOTAL,
};

/// Capacity of the reply channel from the reader to the writer.
const REPLY_BUFFER: usize = 64;

/// How long the writer gets to flush its Close frame after the reader ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Run a `WebSocket` session for an authenticated connection.
///
/// 1. Sends the `connected` frame
/// 2. Spawns the writer: deliveries, replies and periodic Ping frames
/// 3. Reads frames, dispatching each through the relay; every inbound
///    message (Ping/Pong included) counts as a heartbeat
/// 4. Disconnects from the relay on close, transport error, or when the
///    relay closes the connection (heartbeat timeout, shutdown)
#[instrument(skip_all, fields(connection_id = %handle.connection.id(), principal = %handle.connection.principal()))]
pub async fn run_ws_session(
    socket: WebSocket,
    handle: ConnectionHandle,
    relay: Arc<Relay>,
    config: ServerConfig,
) {
    let ConnectionHandle {
        connection,
        mut outbound,
    } = handle;
    let id = connection.id().clone();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerFrame>(REPLY_BUFFER);

    let started = std::time::Instant::now();
    counter!(WS_SESSIONS_TOTAL).increment(1);
    gauge!(WS_SESSIONS_ACTIVE).increment(1.0);

    let connected = ServerFrame::Connected {
        connection_id: id.clone(),
        principal: connection.principal().clone(),
        heartbeat_ms: millis(config.heartbeat_interval),
        reconnect_delay_ms: millis(config.reconnect_delay),
    };
    if ws_tx
        .send(Message::Text(connected.to_json().into()))
        .await
        .is_err()
    {
        warn!("failed to send connected frame");
        let _ = relay.disconnect(&id, DisconnectReason::TransportError);
        gauge!(WS_SESSIONS_ACTIVE).decrement(1.0);
        return;
    }
    info!("websocket session started");

    let cancel = connection.cancel_token().clone();
    let ping_every = config.heartbeat_interval;
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping.tick().await;

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                reply = reply_rx.recv() => match reply {
                    Some(frame) => frame,
                    None => break,
                },
                delivery = outbound.recv() => match delivery {
                    Some(delivery) => ServerFrame::from_delivery(&delivery),
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    let reason = loop {
        let msg = tokio::select! {
            () = connection.cancel_token().cancelled() => break None,
            msg = ws_rx.next() => msg,
        };
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break Some(DisconnectReason::TransportError);
            }
            None => break Some(DisconnectReason::ClientClosed),
        };

        if relay.heartbeat(&id).is_err() {
            break None;
        }
        let text = match msg {
            Message::Text(ref t) => t.as_str().to_owned(),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break Some(DisconnectReason::ClientClosed);
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let reply = handle_message(&text, &relay, &id);
        if reply_tx.send(reply).await.is_err() {
            break Some(DisconnectReason::TransportError);
        }
    };

    if let Some(reason) = reason {
        let _ = relay.disconnect(&id, reason);
    }
    drop(reply_tx);
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(
        state = %connection.state(),
        duration_secs = started.elapsed().as_secs(),
        "websocket session ended"
    );
    counter!(WS_SESSIONS_CLOSED_TOTAL).increment(1);
    gauge!(WS_SESSIONS_ACTIVE).decrement(1.0);
    histogram!(WS_SESSION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
