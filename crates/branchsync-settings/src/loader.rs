//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `BRANCHSYNC_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::SyncSettings;

/// Resolve the default settings file path (`~/.branchsync/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".branchsync").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<SyncSettings> {
    let defaults = serde_json::to_value(SyncSettings::default())?;

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
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject settings the gateway cannot run with.
pub fn validate(settings: &SyncSettings) -> Result<()> {
    let mut seen = HashSet::new();
    for module in &settings.modules {
        if module.module_id.trim().is_empty() {
            return Err(SettingsError::InvalidValue("module id must not be empty".into()));
        }
        if !seen.insert(module.module_id.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "module {} declared twice",
                module.module_id
            )));
        }
    }
    if settings.sync.trans_history_limit == 0 {
        return Err(SettingsError::InvalidValue(
            "transHistoryLimit must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply `BRANCHSYNC_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut SyncSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Invalid values are logged and ignored.
pub fn apply_overrides_from(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let parsed = |name: &str, parse: &dyn Fn(&str) -> Option<u64>| {
        let raw = string(name)?;
        let result = parse(&raw);
        if result.is_none() {
            warn!(key = name, value = %raw, "invalid env var, ignoring");
        }
        result
    };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("BRANCHSYNC_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = parsed("BRANCHSYNC_PORT", &|s| parse_u64_range(s, 1, 65_535)) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = string("BRANCHSYNC_SERVER_ID") {
        settings.server.server_id = Some(v);
    }
    if let Some(v) = parsed("BRANCHSYNC_MAX_CONNECTIONS", &|s| parse_u64_range(s, 1, 1_000_000)) {
        settings.server.max_connections = usize::try_from(v).unwrap_or(settings.server.max_connections);
    }
    if let Some(v) = parsed("BRANCHSYNC_HEARTBEAT_INTERVAL_SECS", &|s| parse_u64_range(s, 1, 3_600)) {
        settings.server.heartbeat_interval_secs = v;
    }

    // ── Sync engine ─────────────────────────────────────────────────
    if let Some(v) = parsed("BRANCHSYNC_TRANS_HISTORY_LIMIT", &|s| parse_u64_range(s, 1, 100_000)) {
        settings.sync.trans_history_limit = usize::try_from(v).unwrap_or(settings.sync.trans_history_limit);
    }
    if let Some(v) = parsed("BRANCHSYNC_TRANS_MUTATION_HISTORY_LIMIT", &|s| parse_u64_range(s, 1, 10_000)) {
        settings.sync.trans_mutation_history_limit =
            usize::try_from(v).unwrap_or(settings.sync.trans_mutation_history_limit);
    }
    if let Some(v) = string("BRANCHSYNC_DEFAULT_BRANCH") {
        settings.sync.default_branch = v;
    }
    if let Some(v) = string("BRANCHSYNC_DATA_DIR") {
        settings.sync.data_dir = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("BRANCHSYNC_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = string("BRANCHSYNC_LOG_JSON") {
        match parse_bool(&raw) {
            Some(v) => settings.logging.json = v,
            None => warn!(key = "BRANCHSYNC_LOG_JSON", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
