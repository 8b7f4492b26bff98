//! Fixed token table.

use std::collections::HashMap;

use async_trait::async_trait;
use tagrelay_core::{AuthError, UserId};

use crate::verifier::TokenVerifier;

/// Verifier backed by an in-memory `token → user` table.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenVerifier {
    /// Build from a `token → user id` map.
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self {
            tokens: map.into_iter().map(|(k, v)| (k, UserId::from(v))).collect(),
        }
    }

    /// Add one token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<UserId>) -> Self {
        let _ = self.tokens.insert(token.into(), user.into());
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn known_token_resolves() {
        let verifier = StaticTokenVerifier::default().with_token("t1", "u1");
        assert_eq!(verifier.verify("t1").await.unwrap(), UserId::from("u1"));
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let verifier = StaticTokenVerifier::default().with_token("t1", "u1");
        assert_matches!(verifier.verify("t2").await, Err(AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn empty_token_is_missing() {
        let verifier = StaticTokenVerifier::default();
        assert_eq!(
            verifier.verify("").await.unwrap_err(),
            AuthError::MissingCredentials
        );
    }
}
