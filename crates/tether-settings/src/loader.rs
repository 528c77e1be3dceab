//! Client settings resolution.
//!
//! Compiled defaults come first, then the user's `settings.json` is laid
//! over them with [`overlay`], then `TETHER_*` variables win over both. The
//! result is validated once at the end, so a file can leave a section
//! half-written (say only `reconnect.maxAttempts`) and still load.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ClientSettings;

/// `$TETHER_SETTINGS` when set, otherwise `$HOME/.tether/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string("TETHER_SETTINGS") {
        return PathBuf::from(explicit);
    }
    std::env::var_os("HOME")
        .map_or_else(std::env::temp_dir, PathBuf::from)
        .join(".tether")
        .join("settings.json")
}

/// Load settings from [`settings_path`] with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        overlay(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ClientSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Lay user-supplied settings over `base`.
///
/// Sections (`server`, `reconnect`, `auth`, `reconciliation`, `sync`,
/// `logging`) are combined field by field. Lists such as `sync.authKeys`
/// are taken from the user as a whole, never appended to the defaults.
/// A `null` field leaves the default in place.
pub fn overlay(base: Value, user: Value) -> Value {
    let Value::Object(fields) = user else {
        return user;
    };
    let Value::Object(mut section) = base else {
        return Value::Object(fields);
    };
    for (key, value) in fields.into_iter().filter(|(_, v)| !v.is_null()) {
        let combined = match section.remove(&key) {
            Some(existing) => overlay(existing, value),
            None => value,
        };
        let _ = section.insert(key, combined);
    }
    Value::Object(section)
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_URL") {
        settings.server.url = v;
    }
    if let Some(v) = read_env_string("TETHER_REFRESH_URL") {
        settings.server.refresh_url = Some(v);
    }
    if let Some(v) = read_env_string("TETHER_LOGOUT_URL") {
        settings.server.logout_url = Some(v);
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = read_env_u32("TETHER_RECONNECT_MAX_ATTEMPTS", 0, 100) {
        settings.reconnect.max_attempts = v;
    }
    if let Some(v) = read_env_u64("TETHER_RECONNECT_BASE_DELAY_MS", 10, 60_000) {
        settings.reconnect.base_delay_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_RECONNECT_MAX_DELAY_MS", 10, 600_000) {
        settings.reconnect.max_delay_ms = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_REFRESH_CHECK_INTERVAL_MS", 100, 3_600_000) {
        settings.auth.refresh_check_interval_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_CREDENTIAL_DEBOUNCE_MS", 0, 10_000) {
        settings.auth.credential_debounce_ms = v;
    }

    // ── Reconciliation ──────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_CONFIRMATION_TIMEOUT_MS", 100, 600_000) {
        settings.reconciliation.confirmation_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_SWEEP_INTERVAL_MS", 100, 600_000) {
        settings.reconciliation.sweep_interval_ms = v;
    }

    // ── Sync / logging ──────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_AUTH_KEYS") {
        let keys = parse_key_list(&v);
        if !keys.is_empty() {
            settings.sync.auth_keys = keys;
        }
    }
    if let Some(v) = read_env_string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a comma-separated key list, dropping blanks.
pub fn parse_key_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    // ── overlay ─────────────────────────────────────────────────────

    #[test]
    fn overlay_keeps_untouched_section_fields() {
        let base = serde_json::json!({"reconnect": {"maxAttempts": 6, "baseDelayMs": 1000}});
        let user = serde_json::json!({"reconnect": {"maxAttempts": 2}});
        let merged = overlay(base, user);
        assert_eq!(merged["reconnect"]["maxAttempts"], 2);
        assert_eq!(merged["reconnect"]["baseDelayMs"], 1000);
    }

    #[test]
    fn overlay_replaces_auth_key_list() {
        let base = serde_json::json!({"sync": {"authKeys": ["auth_token", "refresh_token"]}});
        let user = serde_json::json!({"sync": {"authKeys": ["jwt"]}});
        let merged = overlay(base, user);
        assert_eq!(merged["sync"]["authKeys"], serde_json::json!(["jwt"]));
    }

    #[test]
    fn overlay_null_keeps_default() {
        let base = serde_json::json!({"logging": {"level": "info"}});
        let merged = overlay(base, serde_json::json!({"logging": {"level": null}}));
        assert_eq!(merged["logging"]["level"], "info");
    }

    #[test]
    fn overlay_scalar_replaces_section() {
        let base = serde_json::json!({"server": {"url": "ws://localhost"}});
        let merged = overlay(base, serde_json::json!({"server": 42}));
        assert_eq!(merged["server"], 42);
    }

    #[test]
    fn overlay_adds_unknown_fields() {
        let merged = overlay(serde_json::json!({}), serde_json::json!({"extra": {"a": 1}}));
        assert_eq!(merged["extra"]["a"], 1);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.version, ClientSettings::default().version);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"reconnect": {"maxAttempts": 2}, "reconciliation": {"retentionMs": 1000}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.reconnect.max_attempts, 2);
        assert_eq!(settings.reconnect.base_delay_ms, 1000);
        assert_eq!(settings.reconciliation.retention_ms, 1000);
        assert_eq!(settings.reconciliation.confirmation_timeout_ms, 5000);
    }

    #[test]
    fn load_auth_keys_replace_not_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"sync": {"authKeys": ["jwt"]}}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.sync.auth_keys, vec!["jwt".to_string()]);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::Json(_)
        ));
    }

    #[test]
    fn load_out_of_range_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"auth": {"shortLivedRatio": 3.0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::InvalidValue(_)
        ));
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_u32_bounds() {
        assert_eq!(parse_u32_range("6", 0, 100), Some(6));
        assert_eq!(parse_u32_range("101", 0, 100), None);
        assert_eq!(parse_u32_range("-1", 0, 100), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("5000", 100, 600_000), Some(5000));
        assert_eq!(parse_u64_range("50", 100, 600_000), None);
        assert_eq!(parse_u64_range("abc", 100, 600_000), None);
    }

    #[test]
    fn parse_key_list_trims_and_drops_blanks() {
        assert_eq!(
            parse_key_list(" auth_token, ,session_id ,"),
            vec!["auth_token".to_string(), "session_id".to_string()]
        );
        assert!(parse_key_list(" , ").is_empty());
    }
}
