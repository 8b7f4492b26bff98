//! `RelayServer`: Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tagrelay_auth::extract_bearer;
use tagrelay_core::RelayError;
use tagrelay_relay::{DisconnectReason, Relay};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_HANDSHAKE_REJECTS_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::protocol::ServerFrame;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay.
    pub relay: Arc<Relay>,
    /// Transport settings.
    pub config: ServerConfig,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The tag relay server.
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a new server around `relay`.
    pub fn new(config: ServerConfig, relay: Arc<Relay>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            config,
            relay,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            config: self.config.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve until the shutdown token fires.
    ///
    /// Returns the bound address (useful with port `0`) and the server task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%addr, "tag relay listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
            info!("server stopped");
        });
        Ok((addr, handle))
    }

    /// The relay behind this server.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.relay.connection_count(),
        state.relay.session_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

/// Handshake query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Bearer token, for clients that cannot set upgrade headers.
    pub token: Option<String>,
}

/// Token presented in the upgrade request: `Authorization: Bearer` first,
/// then `?token=`.
fn handshake_token(headers: &HeaderMap, params: WsParams) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(str::to_owned)
        .or(params.token)
        .unwrap_or_default()
}

/// GET /ws: authenticate, then upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let token = handshake_token(&headers, params);
    let handle = match state.relay.connect(&token).await {
        Ok(handle) => handle,
        Err(err) => return reject_handshake(&err),
    };

    let id = handle.connection.id().clone();
    let failed_relay = Arc::clone(&state.relay);
    let relay = state.relay;
    let config = state.config;
    ws.max_message_size(config.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(connection_id = %id, error = %e, "websocket upgrade failed");
            let _ = failed_relay.disconnect(&id, DisconnectReason::TransportError);
        })
        .on_upgrade(move |socket| run_ws_session(socket, handle, relay, config))
}

fn reject_handshake(err: &RelayError) -> Response {
    let status = match err {
        RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
        RelayError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    counter!(WS_HANDSHAKE_REJECTS_TOTAL, "status" => status.as_str().to_owned()).increment(1);
    (status, Json(ServerFrame::relay_error(err))).into_response()
}
