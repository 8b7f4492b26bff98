//! # tagrelay-core
//!
//! Foundation types shared by every tag relay crate:
//!
//! - **Branded IDs**: `SessionId`, `ConnectionId`, `UserId` as newtypes for type safety
//! - **Tag events**: `TagType`, `RawTag` (wire payload), `TagDraft` (validated),
//!   `TagEvent` (sequenced, immutable), `GapMarker` and `Delivery`
//! - **Errors**: `RelayError` hierarchy via `thiserror` with stable wire codes
//! - **Logging**: `tracing` subscriber initialization
//! - **Defaults**: protocol constants (heartbeat interval, queue capacity, retention)

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod tag;

pub use errors::{AuthError, CapacityError, RelayError, ValidationError};
pub use ids::{ConnectionId, SessionId, UserId};
pub use tag::{Delivery, GapMarker, RawTag, TagDraft, TagEvent, TagType};
