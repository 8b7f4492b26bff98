//! The identity collaborator seam.

use std::sync::Arc;

use async_trait::async_trait;
use tagrelay_core::{AuthError, UserId};

/// Turns a bearer token into an authenticated principal.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` and return the user it was issued to.
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Verifier shared between the connection manager and the transport.
pub type SharedVerifier = Arc<dyn TokenVerifier>;

/// Strip the `Bearer ` scheme from an `Authorization` header value.
///
/// The scheme is matched case-insensitively. Returns `None` for other
/// schemes or an empty token.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
