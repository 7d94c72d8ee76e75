//! # serena-settings
//!
//! Layered configuration for the Serena server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`SerenaSettings::default()`])
//! 2. **Settings file** (`serena.json` or `$SERENA_SETTINGS`, deep-merged over defaults)
//! 3. **Environment variables** (`GOOGLE_API_KEY`, `SERENA_*`)
//!
//! [`SerenaSettings::validate`] is run once at startup; the server refuses to
//! start on any error.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;
mod validate;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings_from_path, settings_path};
pub use types::*;
