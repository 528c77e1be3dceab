//! Credential refresh policy.
//!
//! A pure function of the token's claims and the current time:
//!
//! - undecodable token: refresh (fail-safe), decode error logged
//! - no `exp` claim: never refresh
//! - lifetime `exp - iat` (or the default lifetime when `iat` is absent)
//!   below the short-lived boundary: threshold is `floor(ratio * lifetime)`
//! - otherwise (a lifetime equal to the boundary included): fixed threshold
//! - refresh when `time_remaining <= threshold`

use std::time::Duration;

use serde::Serialize;
use tether_settings::AuthSettings;
use tracing::warn;

use crate::credential::{Credential, now_secs};

/// Thresholds used by [`TokenLifecycleManager`].
#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleConfig {
    /// Lifetime assumed when the token has no `iat` claim.
    pub default_lifetime_secs: i64,
    /// Lifetimes strictly below this are short-lived.
    pub short_lived_boundary_secs: i64,
    /// Fraction of a short-lived lifetime used as the threshold.
    pub short_lived_ratio: f64,
    /// Threshold for everything else.
    pub normal_threshold_secs: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_lifetime_secs: 900,
            short_lived_boundary_secs: 300,
            short_lived_ratio: 0.25,
            normal_threshold_secs: 300,
        }
    }
}

impl From<&AuthSettings> for LifecycleConfig {
    fn from(s: &AuthSettings) -> Self {
        Self {
            default_lifetime_secs: s.default_lifetime_secs,
            short_lived_boundary_secs: s.short_lived_boundary_secs,
            short_lived_ratio: s.short_lived_ratio,
            normal_threshold_secs: s.normal_threshold_secs,
        }
    }
}

/// Outcome of one evaluation, for logs and debugging panels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshDiagnostics {
    /// Whether a refresh is due.
    pub needs_refresh: bool,
    /// Seconds until `exp` (negative once expired).
    pub time_until_expiry: Option<i64>,
    /// Lifetime used for the threshold.
    pub total_lifetime: Option<i64>,
    /// Threshold that was applied.
    pub refresh_threshold: Option<i64>,
}

/// Decides whether and when a credential should be refreshed.
#[derive(Clone, Debug, Default)]
pub struct TokenLifecycleManager {
    config: LifecycleConfig,
}

impl TokenLifecycleManager {
    /// Create a manager with explicit thresholds.
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    /// Active thresholds.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Threshold in seconds for a credential with the given lifetime.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn refresh_threshold(&self, lifetime_secs: i64) -> i64 {
        if lifetime_secs < self.config.short_lived_boundary_secs {
            (self.config.short_lived_ratio * lifetime_secs as f64).floor() as i64
        } else {
            self.config.normal_threshold_secs
        }
    }

    /// Whether `token` needs a refresh now.
    pub fn needs_refresh(&self, token: &str) -> bool {
        self.needs_refresh_at(token, now_secs())
    }

    /// Whether `token` needs a refresh at `now` (seconds since the epoch).
    pub fn needs_refresh_at(&self, token: &str, now: i64) -> bool {
        self.evaluate(token, now).needs_refresh
    }

    /// Full evaluation of a raw token at `now`.
    pub fn evaluate(&self, token: &str, now: i64) -> RefreshDiagnostics {
        match Credential::decode(token) {
            Ok(credential) => self.evaluate_credential(&credential, now),
            Err(error) => {
                warn!(%error, "token decode error, treating credential as needing refresh");
                RefreshDiagnostics {
                    needs_refresh: true,
                    ..RefreshDiagnostics::default()
                }
            }
        }
    }

    /// Evaluation of an already decoded credential.
    pub fn evaluate_credential(&self, credential: &Credential, now: i64) -> RefreshDiagnostics {
        let Some(remaining) = credential.time_remaining(now) else {
            return RefreshDiagnostics::default();
        };
        let lifetime = credential
            .lifetime_seconds()
            .unwrap_or(self.config.default_lifetime_secs);
        let threshold = self.refresh_threshold(lifetime);

        RefreshDiagnostics {
            needs_refresh: remaining <= threshold,
            time_until_expiry: Some(remaining),
            total_lifetime: Some(lifetime),
            refresh_threshold: Some(threshold),
        }
    }

    /// How long until `token` becomes due.
    ///
    /// `Some(ZERO)` when already due (undecodable tokens included), `None`
    /// when the token never expires.
    pub fn time_until_refresh(&self, token: &str, now: i64) -> Option<Duration> {
        let diagnostics = self.evaluate(token, now);
        if diagnostics.needs_refresh {
            return Some(Duration::ZERO);
        }
        let remaining = diagnostics.time_until_expiry?;
        let threshold = diagnostics.refresh_threshold?;
        let secs = u64::try_from(remaining - threshold).unwrap_or(0);
        Some(Duration::from_secs(secs))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
