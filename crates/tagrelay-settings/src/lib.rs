//! # tagrelay-settings
//!
//! Configuration management with layered sources for the tag relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `~/.tagrelay/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TAGRELAY_*` overrides (highest priority)
//!
//! The binary applies CLI flags on top of the loaded value.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, merge_into, settings_path};
pub use types::*;
