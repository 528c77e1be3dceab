//! Settings schema.
//!
//! Every struct uses `#[serde(default)]` so a partial user file only has to
//! name the values it changes.

use serde::{Deserialize, Serialize};
use tether_core::ReconnectPolicy;

use crate::errors::{Result, SettingsError};

/// Root settings object (`~/.tether/settings.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Settings schema version.
    pub version: String,
    /// Backend endpoints.
    pub server: ServerSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Credential lifetime and refresh.
    pub auth: AuthSettings,
    /// Optimistic message reconciliation.
    pub reconciliation: ReconciliationSettings,
    /// Cross-tab session sync.
    pub sync: SyncSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            reconnect: ReconnectPolicy::default(),
            auth: AuthSettings::default(),
            reconciliation: ReconciliationSettings::default(),
            sync: SyncSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Reject values that would stall timers or break the refresh policy.
    pub fn validate(&self) -> Result<()> {
        if self.server.url.is_empty() {
            return Err(SettingsError::InvalidValue("server.url is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.auth.short_lived_ratio) {
            return Err(SettingsError::InvalidValue(format!(
                "auth.shortLivedRatio must be within 0..=1, got {}",
                self.auth.short_lived_ratio
            )));
        }
        if self.auth.refresh_check_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "auth.refreshCheckIntervalMs must be > 0".into(),
            ));
        }
        if self.reconciliation.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "reconciliation.sweepIntervalMs must be > 0".into(),
            ));
        }
        if self.reconciliation.confirmation_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "reconciliation.confirmationTimeoutMs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Backend endpoints and transport sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// WebSocket URL of the event stream.
    pub url: String,
    /// Token refresh endpoint (HTTP POST).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,
    /// Backend logout endpoint (HTTP POST).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logout_url: Option<String>,
    /// Frames buffered while connecting before `queue` starts refusing.
    pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            refresh_url: None,
            logout_url: None,
            outbound_queue_capacity: 256,
        }
    }
}

/// Credential lifetime policy and refresh cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Lifetime assumed when a token has no `iat` claim.
    pub default_lifetime_secs: i64,
    /// Tokens with a lifetime strictly below this are "short-lived".
    pub short_lived_boundary_secs: i64,
    /// Fraction of a short-lived token's lifetime used as its threshold.
    pub short_lived_ratio: f64,
    /// Fixed threshold for normal tokens.
    pub normal_threshold_secs: i64,
    /// Upper bound between refresh evaluations.
    pub refresh_check_interval_ms: u64,
    /// Quiet period that collapses bursts of credential updates.
    pub credential_debounce_ms: u64,
    /// Shared-storage key holding the access token.
    pub token_key: String,
    /// Shared-storage key holding the refresh token.
    pub refresh_token_key: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            default_lifetime_secs: 900,
            short_lived_boundary_secs: 300,
            short_lived_ratio: 0.25,
            normal_threshold_secs: 300,
            refresh_check_interval_ms: 15_000,
            credential_debounce_ms: 250,
            token_key: "auth_token".to_string(),
            refresh_token_key: "refresh_token".to_string(),
        }
    }
}

/// Optimistic message timers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconciliationSettings {
    /// Per-message confirmation timeout.
    pub confirmation_timeout_ms: u64,
    /// Interval of the retention sweep.
    pub sweep_interval_ms: u64,
    /// How long resolved messages stay before the sweep drops them.
    pub retention_ms: u64,
    /// Maximum age of a pending message for fingerprint matching.
    pub fingerprint_window_ms: u64,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: 5000,
            sweep_interval_ms: 2000,
            retention_ms: 60_000,
            fingerprint_window_ms: 10_000,
        }
    }
}

/// Cross-tab synchronization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Storage keys whose removal signs every tab out.
    pub auth_keys: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auth_keys: [
                "auth_token",
                "access_token",
                "refresh_token",
                "id_token",
                "session_id",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

/// Logging.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
