//! `WebSocket` gateway: frame protocol, dispatch and per-socket session loop.

pub mod handler;
pub mod protocol;
pub mod session;
