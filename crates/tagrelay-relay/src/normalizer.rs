//! Validation and normalization of inbound tag payloads.
//!
//! The author of a tag is always the authenticated principal. A payload may
//! omit `userId` (it is filled in) but may not name anyone else.

use chrono::{DateTime, Utc};
use tagrelay_core::constants::MAX_SESSION_ID_LEN;
use tagrelay_core::{RawTag, SessionId, TagDraft, TagType, UserId, ValidationError};

/// Check a session identifier taken from a destination.
pub fn validate_session_id(raw: &str) -> Result<SessionId, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::MissingSessionId);
    }
    if raw.len() > MAX_SESSION_ID_LEN {
        return Err(ValidationError::InvalidSessionId(format!(
            "longer than {MAX_SESSION_ID_LEN} bytes"
        )));
    }
    if raw.chars().any(|c| c == '/' || c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidSessionId(raw.to_owned()));
    }
    Ok(SessionId::from(raw))
}

/// Validate `raw` for `session_id` as published by `principal`, stamping
/// the current time as the authoritative receipt time.
pub fn normalize(
    raw: &RawTag,
    session_id: &str,
    principal: &UserId,
) -> Result<TagDraft, ValidationError> {
    normalize_at(raw, session_id, principal, Utc::now())
}

/// [`normalize`] with an explicit receipt time.
pub fn normalize_at(
    raw: &RawTag,
    session_id: &str,
    principal: &UserId,
    received_at: DateTime<Utc>,
) -> Result<TagDraft, ValidationError> {
    let session_id = validate_session_id(session_id)?;

    let tag_type: TagType = match raw.tag_type.as_deref() {
        None | Some("") => return Err(ValidationError::MissingTagType),
        Some(t) => t.parse()?,
    };

    match raw.user_id.as_deref() {
        None | Some("") => {}
        Some(claimed) if claimed == principal.as_str() => {}
        Some(claimed) => {
            return Err(ValidationError::AuthorMismatch {
                claimed: claimed.to_owned(),
                principal: principal.to_string(),
            });
        }
    }

    if let Some(ts) = raw.timestamp {
        if ts < 0 {
            return Err(ValidationError::InvalidTimestamp(ts));
        }
    }

    Ok(TagDraft {
        session_id,
        tag_type,
        user_id: principal.clone(),
        client_timestamp: raw.timestamp,
        received_at,
    })
}
