//! HS256 JWT verification.
//!
//! Tokens are issued by the external identity service and signed with a
//! shared secret. The principal is the `sub` claim; `exp` is mandatory.
//! Issuer and audience are checked only when configured.

use std::fmt;

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tagrelay_core::{AuthError, UserId};

use crate::verifier::TokenVerifier;

/// Claims the relay reads from a token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user the token was issued to.
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verifies HS256-signed JWTs.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verifier for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Require the `iss` claim to equal `issuer`.
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require the `aud` claim to contain `audience`.
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("iss", &self.validation.iss)
            .field("aud", &self.validation.aud)
            .finish_non_exhaustive()
    }
}

fn map_error(err: &jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidIssuer => AuthError::InvalidToken("issuer mismatch".into()),
        ErrorKind::InvalidAudience => AuthError::InvalidToken("audience mismatch".into()),
        ErrorKind::InvalidSignature => AuthError::InvalidToken("bad signature".into()),
        _ => AuthError::InvalidToken(err.to_string()),
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            let err = map_error(&e);
            tracing::debug!(error = %e, "token rejected");
            err
        })?;
        match data.claims.sub {
            Some(sub) if !sub.trim().is_empty() => Ok(UserId::from(sub)),
            _ => Err(AuthError::MissingSubject),
        }
    }
}
