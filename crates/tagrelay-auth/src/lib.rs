//! # tagrelay-auth
//!
//! Bearer token verification for relay connections.
//!
//! The relay never issues credentials. It asks a [`TokenVerifier`] to turn
//! the token presented at handshake time into an authenticated principal:
//!
//! - [`JwtVerifier`]: HS256 tokens signed by the identity service
//! - [`StaticTokenVerifier`]: fixed token table for local development
//!
//! [`verifier_from_settings`] picks one from [`AuthSettings`].

#![deny(unsafe_code)]

pub mod jwt;
pub mod static_tokens;
pub mod verifier;

pub use jwt::{Claims, JwtVerifier};
pub use static_tokens::StaticTokenVerifier;
pub use verifier::{SharedVerifier, TokenVerifier, extract_bearer};

use std::sync::Arc;

use tagrelay_settings::AuthSettings;

/// Build the verifier described by the auth settings.
///
/// A configured JWT secret wins; otherwise the static token table is used
/// (which rejects everything when empty).
pub fn verifier_from_settings(settings: &AuthSettings) -> SharedVerifier {
    match &settings.jwt_secret {
        Some(secret) => {
            tracing::info!(
                issuer = settings.issuer.as_deref(),
                audience = settings.audience.as_deref(),
                "using HS256 token verification"
            );
            let mut verifier = JwtVerifier::new(secret.as_bytes());
            if let Some(iss) = &settings.issuer {
                verifier = verifier.with_issuer(iss);
            }
            if let Some(aud) = &settings.audience {
                verifier = verifier.with_audience(aud);
            }
            Arc::new(verifier)
        }
        None => {
            if settings.static_tokens.is_empty() {
                tracing::warn!("no jwtSecret or staticTokens configured, every connection will be refused");
            } else {
                tracing::warn!(
                    tokens = settings.static_tokens.len(),
                    "using static token table, not for production"
                );
            }
            Arc::new(StaticTokenVerifier::from_map(settings.static_tokens.clone()))
        }
    }
}
