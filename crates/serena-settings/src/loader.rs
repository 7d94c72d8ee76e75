//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SerenaSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ArtifactBackend, SerenaSettings};

/// Resolve the settings file path: `SERENA_SETTINGS` or `./serena.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("SERENA_SETTINGS")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("serena.json"))
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SerenaSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<SerenaSettings> {
    let defaults = serde_json::to_value(SerenaSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut SerenaSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup (env in production, a map in tests).
///
/// Invalid numeric values are ignored with a warning.
pub fn apply_overrides<F>(settings: &mut SerenaSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Credentials ─────────────────────────────────────────────────
    if let Some(v) = string("GOOGLE_API_KEY") {
        settings.gemini.api_key = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("SERENA_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = parsed(&lookup, "SERENA_PORT", |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = string("SERENA_STATIC_DIR") {
        settings.server.static_dir = PathBuf::from(v);
    }

    // ── Warehouse ───────────────────────────────────────────────────
    if let Some(v) = string("SERENA_WAREHOUSE_PATH") {
        settings.warehouse.path = PathBuf::from(v);
    }
    if let Some(v) = string("SERENA_METADATA_PATH") {
        settings.warehouse.metadata_path = PathBuf::from(v);
    }
    if let Some(v) = string("SERENA_DATASET") {
        settings.warehouse.dataset = v;
    }

    // ── Delivery & artifacts ────────────────────────────────────────
    if let Some(v) = string("SERENA_EMAIL_WEBHOOK_URL") {
        settings.email.webhook_url = Some(v);
    }
    if let Some(v) = string("SERENA_ARTIFACT_DB") {
        settings.artifacts.backend = ArtifactBackend::Sqlite;
        settings.artifacts.sqlite_path = PathBuf::from(v);
    }

    // ── Runtime ─────────────────────────────────────────────────────
    if let Some(v) = parsed(&lookup, "SERENA_TOOL_TIMEOUT_SECS", |s| {
        parse_u64_range(s, 1, 3600)
    }) {
        settings.runtime.tool_timeout_secs = v;
    }
    if let Some(v) = string("SERENA_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = parsed(&lookup, "SERENA_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }

    // ── Models ──────────────────────────────────────────────────────
    let models = &mut settings.models;
    for (name, slot) in [
        ("SERENA_MODEL_SUPERVISOR", &mut models.supervisor),
        ("SERENA_MODEL_CHAT", &mut models.chat),
        ("SERENA_MODEL_SQL", &mut models.sql),
        ("SERENA_MODEL_VISUALIZATION", &mut models.visualization),
        ("SERENA_MODEL_POSTER", &mut models.poster),
        ("SERENA_MODEL_EMAIL", &mut models.email),
        ("SERENA_MODEL_IMAGE", &mut models.image),
        ("SERENA_MODEL_SPEECH", &mut models.speech),
        ("SERENA_MODEL_TRANSCRIPTION", &mut models.transcription),
    ] {
        if let Some(v) = string(name) {
            *slot = v;
        }
    }
}

fn parsed<F, T>(lookup: &F, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
{
    let val = lookup(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
