//! Package-level constants and protocol defaults.

use std::time::Duration;

/// Current version of the relay (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "tagrelay";

/// Interval at which clients are expected to heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// How long a session with no subscribers survives before it is collected.
pub const DEFAULT_SESSION_GRACE: Duration = Duration::from_secs(60);

/// Capacity of each subscriber's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Smallest usable queue capacity: one slot for the gap marker, one for the newest event.
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// Number of recent events retained per session for replay.
pub const DEFAULT_RETENTION_EVENTS: usize = 200;

/// Maximum age of a retained event.
pub const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(300);

/// Reconnect delay advertised to clients in the `connected` frame.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Longest accepted session identifier, in bytes.
pub const MAX_SESSION_ID_LEN: usize = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_semver() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert_eq!(parts.len(), 3, "VERSION must be semver (MAJOR.MINOR.PATCH)");
        for part in parts {
            let _: u32 = part.parse().expect("each semver segment must be a number");
        }
    }

    #[test]
    fn name_is_lowercase() {
        assert_eq!(NAME, NAME.to_lowercase());
    }

    #[test]
    fn retention_fits_in_default_queue() {
        assert!(DEFAULT_RETENTION_EVENTS < DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn eviction_happens_after_two_missed_heartbeats() {
        assert!(DEFAULT_SESSION_GRACE > DEFAULT_HEARTBEAT_INTERVAL * 2);
    }
}
