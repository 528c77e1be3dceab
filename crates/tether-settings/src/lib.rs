//! # tether-settings
//!
//! Configuration for the tether session layer, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `$TETHER_SETTINGS` or `~/.tether/settings.json`, overlaid field by field
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! There is no process-wide settings instance: callers load a
//! [`ClientSettings`] and hand it to the session they construct, so two
//! sessions in one process can run with different settings.
//!
//! # Usage
//!
//! ```no_run
//! use tether_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("backend: {}", settings.server.url);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, overlay, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = ClientSettings::default();
        assert_eq!(settings.server.url, "ws://127.0.0.1:8080/ws");
        assert_eq!(settings.reconnect.max_attempts, 6);
        assert_eq!(settings.auth.default_lifetime_secs, 900);
        assert_eq!(settings.auth.normal_threshold_secs, 300);
        assert_eq!(settings.reconciliation.confirmation_timeout_ms, 5000);
        assert!(settings.sync.auth_keys.iter().any(|k| k == "auth_token"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn overlay_re_exported() {
        let merged = overlay(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
