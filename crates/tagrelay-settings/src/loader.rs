//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! See [`merge_into`] for how a file overlays the defaults.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.tagrelay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tagrelay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, or the merged result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut merged = serde_json::to_value(RelaySettings::default())?;
    if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        merge_into(&mut merged, serde_json::from_str(&content)?);
    } else {
        debug!(?path, "settings file not found, using defaults");
    }

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Overlay `source` onto `target`.
///
/// Objects merge per key, recursively. Any other value replaces the target
/// wholesale. `null` keys in `source` leave the target untouched.
pub fn merge_into(target: &mut Value, source: Value) {
    let Value::Object(source_map) = source else {
        *target = source;
        return;
    };
    let Value::Object(target_map) = target else {
        *target = Value::Object(source_map);
        return;
    };
    for (key, value) in source_map {
        if value.is_null() {
            continue;
        }
        match target_map.get_mut(&key) {
            Some(existing) => merge_into(existing, value),
            None => {
                let _ = target_map.insert(key, value);
            }
        }
    }
}

/// Apply `TAGRELAY_*` environment overrides.
///
/// Unparseable or out-of-range values are logged and skipped.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    let server = &mut settings.server;
    if let Some(v) = env_string("TAGRELAY_HOST") {
        server.host = v;
    }
    if let Some(v) = env_in_range("TAGRELAY_PORT", 0..=u16::MAX) {
        server.port = v;
    }

    let relay = &mut settings.relay;
    if let Some(v) = env_in_range("TAGRELAY_HEARTBEAT_INTERVAL_MS", 100..=600_000) {
        relay.heartbeat_interval_ms = v;
    }
    if let Some(v) = env_in_range("TAGRELAY_SESSION_GRACE_MS", 0..=86_400_000) {
        relay.session_grace_ms = v;
    }
    if let Some(v) = env_in_range("TAGRELAY_QUEUE_CAPACITY", 2..=1_000_000) {
        relay.queue_capacity = v;
    }
    if let Some(v) = env_in_range("TAGRELAY_RETENTION_EVENTS", 0..=1_000_000) {
        relay.retention_events = v;
    }
    if let Some(v) = env_in_range("TAGRELAY_RETENTION_WINDOW_MS", 0..=86_400_000) {
        relay.retention_window_ms = v;
    }
    if let Some(v) = env_in_range("TAGRELAY_MAX_SESSIONS", 1..=10_000_000) {
        relay.max_sessions = v;
    }
    if let Some(v) = env_in_range("TAGRELAY_MAX_CONNECTIONS", 1..=10_000_000) {
        relay.max_connections = v;
    }

    if let Some(v) = env_string("TAGRELAY_JWT_SECRET") {
        settings.auth.jwt_secret = Some(v);
    }
    if let Some(v) = env_string("TAGRELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env_flag("TAGRELAY_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse an on/off flag: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`,
/// case-insensitive.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and accept it only inside `range`.
pub fn parse_in_range<T>(raw: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| range.contains(n))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn env_string(name: &str) -> Option<String> {
    env_var(name).filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env_var(name)?;
    warn_unless(&raw, name, parse_flag(&raw))
}

fn env_in_range<T>(name: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    let raw = env_var(name)?;
    warn_unless(&raw, name, parse_in_range(&raw, range))
}

fn warn_unless<T>(raw: &str, name: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key = name, value = raw, "ignoring invalid environment override");
    }
    parsed
}
