//! # tagrelay-relay
//!
//! The real-time tag relay core.
//!
//! - [`connection`]: authenticated connections and heartbeat liveness
//! - [`registry`] / [`session`]: live sessions, sequence numbers, subscribers
//! - [`router`]: sequences validated tags and fans them out in order
//! - [`normalizer`]: validates inbound payloads against the principal
//! - [`delivery`]: replay retention, ack watermarks, client de-duplication
//! - [`queue`]: bounded drop-oldest subscriber queues with gap markers
//! - [`relay`]: the [`Relay`] facade tying it together
//!
//! Publishing never blocks on a subscriber. Each subscription has its own
//! queue and a pump task forwarding into the connection's channel, so a
//! stalled client only ever loses its own oldest events.

#![deny(unsafe_code)]

pub mod connection;
pub mod delivery;
pub mod metrics;
pub mod normalizer;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod sweep;

pub use connection::{
    Connection, ConnectionHandle, ConnectionManager, ConnectionState, DisconnectReason,
};
pub use delivery::{AckTracker, RetentionBuffer, SequenceDeduplicator};
pub use normalizer::{normalize, validate_session_id};
pub use queue::{OutboundQueue, PushOutcome};
pub use registry::{RegistryConfig, SessionRegistry, SubscriptionHandle};
pub use relay::{Relay, RelayConfig, SubscribeReceipt};
pub use router::TopicRouter;
pub use session::{Published, Session, Subscription};
pub use sweep::{SweepReport, run_sweeper};
