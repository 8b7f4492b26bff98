//! Error hierarchy for the tag relay.
//!
//! - [`AuthError`]: handshake credential failures; the connection is refused
//! - [`ValidationError`]: malformed or spoofed tag events; the event is dropped
//! - [`CapacityError`]: configured session/connection caps reached
//! - [`RelayError`]: top-level enum returned by relay operations
//!
//! Every variant maps to a stable machine-readable code via `code()`, which
//! the transport puts in `error` frames.

use thiserror::Error;

use crate::ids::ConnectionId;

/// Credential verification failure at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No bearer token was presented.
    #[error("missing bearer token")]
    MissingCredentials,
    /// The token could not be parsed or its signature did not verify.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// The token was valid but has expired.
    #[error("token expired")]
    Expired,
    /// The token verified but carries no usable principal.
    #[error("token has no subject")]
    MissingSubject,
    /// The identity service could not be reached.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Rejection of an inbound tag event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The tag type is not one of `KILL`, `DEATH`, `HIGHLIGHT`.
    #[error("unknown tag type: {0}")]
    UnknownTagType(String),
    /// The payload carried no tag type.
    #[error("missing tag type")]
    MissingTagType,
    /// The destination carried no session id.
    #[error("missing session id")]
    MissingSessionId,
    /// The session id is too long or contains forbidden characters.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    /// The payload's author does not match the authenticated principal.
    #[error("author {claimed} does not match authenticated user {principal}")]
    AuthorMismatch {
        /// Author id claimed by the payload.
        claimed: String,
        /// Principal bound to the connection.
        principal: String,
    },
    /// The client timestamp is negative.
    #[error("invalid client timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// A configured resource cap was reached; new work is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    /// Too many live sessions.
    #[error("session limit reached ({limit})")]
    Sessions {
        /// Configured limit.
        limit: usize,
    },
    /// Too many live connections.
    #[error("connection limit reached ({limit})")]
    Connections {
        /// Configured limit.
        limit: usize,
    },
}

/// Top-level error for relay operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Tag event rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Resource cap reached.
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    /// No connection with this id is registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    /// The connection exists but has been disconnected.
    #[error("connection {0} is disconnected")]
    NotConnected(ConnectionId),
}

impl RelayError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Capacity(_) => "CAPACITY_EXCEEDED",
            Self::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            Self::NotConnected(_) => "NOT_CONNECTED",
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn validation_converts_into_relay_error() {
        let err: RelayError = ValidationError::UnknownTagType("HEADSHOT".into()).into();
        assert_matches!(err, RelayError::Validation(ValidationError::UnknownTagType(_)));
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn transparent_display() {
        let err: RelayError = ValidationError::UnknownTagType("HEADSHOT".into()).into();
        assert_eq!(err.to_string(), "unknown tag type: HEADSHOT");
    }

    #[test]
    fn author_mismatch_display() {
        let err = ValidationError::AuthorMismatch {
            claimed: "me".into(),
            principal: "u1".into(),
        };
        assert_eq!(
            err.to_string(),
            "author me does not match authenticated user u1"
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(RelayError::from(AuthError::Expired).code(), "AUTH_ERROR");
        assert_eq!(
            RelayError::from(CapacityError::Sessions { limit: 1 }).code(),
            "CAPACITY_EXCEEDED"
        );
        assert_eq!(
            RelayError::UnknownConnection("c1".into()).code(),
            "UNKNOWN_CONNECTION"
        );
        assert_eq!(
            RelayError::NotConnected("c1".into()).code(),
            "NOT_CONNECTED"
        );
    }

    #[test]
    fn capacity_display_includes_limit() {
        let err = CapacityError::Connections { limit: 50 };
        assert_eq!(err.to_string(), "connection limit reached (50)");
    }
}
