//! Token verification settings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How bearer tokens presented at connect time are verified.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Shared HS256 secret of the identity service. Enables JWT verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Required `iss` claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Required `aud` claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Fixed token → user table for local development.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub static_tokens: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_by_default() {
        let auth = AuthSettings::default();
        assert!(auth.jwt_secret.is_none());
        assert!(auth.static_tokens.is_empty());
    }

    #[test]
    fn unset_fields_are_omitted() {
        let json = serde_json::to_value(AuthSettings::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn static_tokens_deserialize() {
        let auth: AuthSettings =
            serde_json::from_str(r#"{"staticTokens":{"dev-token":"u1"}}"#).unwrap();
        assert_eq!(auth.static_tokens.get("dev-token").map(String::as_str), Some("u1"));
    }
}
