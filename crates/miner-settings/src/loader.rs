//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MinerSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `MINER_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::MinerSettings;

/// Resolve the path to the settings file (`~/.points-miner/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home)
        .join(".points-miner")
        .join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MinerSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<MinerSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
fn load_file_layer(path: &Path) -> Result<MinerSettings> {
    let defaults = serde_json::to_value(MinerSettings::default())?;

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
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut MinerSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup (the process env in production).
fn apply_overrides(settings: &mut MinerSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let bool_var = |name: &str| {
        let val = lookup(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    };
    let u64_var = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    };
    let usize_var = |name: &str, min: usize, max: usize| {
        let val = lookup(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    };

    // ── Event bus ───────────────────────────────────────────────────
    if let Some(v) = string("MINER_PUBSUB_URL") {
        settings.pubsub.url = v;
    }
    if let Some(v) = u64_var("MINER_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.pubsub.connect_timeout_ms = v;
    }
    if let Some(v) = u64_var("MINER_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.pubsub.request_timeout_ms = v;
    }
    if let Some(v) = u64_var("MINER_PING_INTERVAL_MS", 1000, 600_000) {
        settings.pubsub.ping_interval_ms = v;
    }
    if let Some(v) = u64_var("MINER_LIVENESS_TIMEOUT_MS", 1000, 3_600_000) {
        settings.pubsub.liveness_timeout_ms = v;
    }
    if let Some(v) = usize_var("MINER_MAX_TOPICS", 1, crate::types::PLATFORM_MAX_TOPICS) {
        settings.pubsub.max_topics_per_connection = v;
    }
    if let Some(v) = u64_var("MINER_RECONNECT_MAX_DELAY_MS", 100, 3_600_000) {
        settings.pubsub.reconnect.max_delay_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("MINER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = bool_var("MINER_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Account ─────────────────────────────────────────────────────
    if let Some(v) = string("MINER_USER_ID") {
        settings.account.user_id = Some(v);
    }
    if let Some(v) = string("MINER_CHANNELS") {
        settings.account.channels = parse_list(&v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, trimming blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"pubsub": {"url": "a", "pingIntervalMs": 1}});
        let source = serde_json::json!({"pubsub": {"pingIntervalMs": 2}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["pubsub"]["pingIntervalMs"], 2);
        assert_eq!(merged["pubsub"]["url"], "a");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"channels": ["1", "2"]});
        let source = serde_json::json!({"channels": ["3"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["channels"], serde_json::json!(["3"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.pubsub.url, "wss://pubsub-edge.twitch.tv/v1");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"account": {"userId": "42", "channels": ["7", "8"]}, "logging": {"json": true}}"#,
        )
        .unwrap();
        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.account.user_id.as_deref(), Some("42"));
        assert_eq!(settings.account.channels, vec!["7", "8"]);
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_file_layer(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"pubsub": {"url": "http://nope"}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut settings = MinerSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("MINER_PUBSUB_URL", "ws://127.0.0.1:9000"),
                ("MINER_PING_INTERVAL_MS", "5000"),
                ("MINER_LOG_JSON", "yes"),
                ("MINER_CHANNELS", "1, 2,,3"),
                ("MINER_USER_ID", "99"),
            ]),
        );
        assert_eq!(settings.pubsub.url, "ws://127.0.0.1:9000");
        assert_eq!(settings.pubsub.ping_interval_ms, 5000);
        assert!(settings.logging.json);
        assert_eq!(settings.account.channels, vec!["1", "2", "3"]);
        assert_eq!(settings.account.user_id.as_deref(), Some("99"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = MinerSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("MINER_PING_INTERVAL_MS", "fast"),
                ("MINER_MAX_TOPICS", "500"),
                ("MINER_LOG_JSON", "maybe"),
                ("MINER_LOG_LEVEL", ""),
            ]),
        );
        assert_eq!(settings.pubsub.ping_interval_ms, 30_000);
        assert_eq!(settings.pubsub.max_topics_per_connection, 50);
        assert!(!settings.logging.json);
        assert_eq!(settings.logging.level, "info");
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("10", 1, 100), Some(10));
        assert_eq!(parse_u64_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("-5", 1, 100), None);
        assert_eq!(parse_usize_range("50", 1, 50), Some(50));
        assert_eq!(parse_usize_range("51", 1, 50), None);
    }

    #[test]
    fn parse_list_trims_and_skips_blanks() {
        assert_eq!(parse_list(" a ,b,, c "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }
}
