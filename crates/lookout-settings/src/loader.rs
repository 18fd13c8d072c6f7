//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LookoutSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `LOOKOUT_*` environment variable overrides (highest priority)
//! 4. [`LookoutSettings::validate`] clamps anything out of range
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::LookoutSettings;

/// Resolve the default settings file (`~/.lookout/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lookout").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LookoutSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LookoutSettings> {
    let mut settings = load_file_layers(path)?;
    apply_env_overrides(&mut settings);
    settings.validate();
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides or validation.
fn load_file_layers(path: &Path) -> Result<LookoutSettings> {
    let defaults = serde_json::to_value(LookoutSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (file/default value kept).
pub fn apply_env_overrides(settings: &mut LookoutSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Override logic with an injectable variable lookup, so tests never touch
/// the process environment.
fn apply_overrides(settings: &mut LookoutSettings, var: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| var(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("LOOKOUT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read(&var, "LOOKOUT_PORT", |v| parse_u16_range(v, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = string("LOOKOUT_COLLABORATOR_URL") {
        settings.collaborator.base_url = v;
    }

    // ── Scheduler ───────────────────────────────────────────────────
    if let Some(v) = read(&var, "LOOKOUT_HIGH_INTERVAL_MS", |v| {
        parse_u64_range(v, 200, 500)
    }) {
        settings.scheduler.high_priority_interval_ms = v;
    }
    if let Some(v) = read(&var, "LOOKOUT_LOW_INTERVAL_MS", |v| {
        parse_u64_range(v, 1_000, 2_000)
    }) {
        settings.scheduler.low_priority_interval_ms = v;
    }

    // ── Archival ────────────────────────────────────────────────────
    if let Some(v) = read(&var, "LOOKOUT_ARCHIVE_ENABLED", parse_bool) {
        settings.archival.enabled = v;
    }
    if let Some(v) = string("LOOKOUT_ARCHIVE_DIR") {
        settings.archival.archive_dir = v;
    }
    if let Some(v) = read(&var, "LOOKOUT_RETENTION_DAYS", |v| {
        parse_u64_range(v, 1, 3_650)
    }) {
        settings.archival.retention_days = v as u32;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("LOOKOUT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read(&var, "LOOKOUT_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

/// Read and parse one variable, warning when it is set but invalid.
fn read<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = var(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
