//! Auth error types.

use tether_core::ErrorCategory;

/// Errors that can occur while decoding, refreshing or storing credentials.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The token could not be decoded into claims.
    #[error("token decode error: {0}")]
    Decode(String),

    /// The refresh endpoint answered with a non-success status.
    #[error("refresh failed ({status}): {message}")]
    Refresh {
        /// HTTP status code.
        status: u16,
        /// Response body or error description.
        message: String,
    },

    /// The backend logout endpoint answered with a non-success status.
    #[error("backend logout failed ({status}): {message}")]
    Logout {
        /// HTTP status code.
        status: u16,
        /// Response body or error description.
        message: String,
    },

    /// The credential store could not complete the operation.
    #[error("credential storage error: {0}")]
    Storage(String),

    /// A required collaborator or value is missing.
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl AuthError {
    /// Category used for status reporting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Decode(_) | Self::Json(_) => ErrorCategory::Decode,
            Self::Http(_) => ErrorCategory::Network,
            Self::Io(_) | Self::Storage(_) => ErrorCategory::Storage,
            Self::Refresh { status, .. } | Self::Logout { status, .. } if *status >= 500 => {
                ErrorCategory::Network
            }
            Self::Refresh { .. } | Self::Logout { .. } | Self::NotConfigured(_) => {
                ErrorCategory::Auth
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
