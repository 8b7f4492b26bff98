//! # tagrelay-server
//!
//! Axum HTTP + `WebSocket` transport for the tag relay.
//!
//! - HTTP endpoints: `/health`, `/metrics` (Prometheus text)
//! - `WebSocket` gateway at `/ws`: bearer-token handshake, JSON frame
//!   protocol, server pings, per-connection outbound writer
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, RelayServer};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
