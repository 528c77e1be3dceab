//! Error classification shared across the session layer.
//!
//! Every failure the session layer can observe falls into one
//! [`ErrorCategory`]. The category decides the recovery path:
//!
//! | Category  | Recovery                                              |
//! |-----------|-------------------------------------------------------|
//! | `Decode`  | treat the credential as due for refresh               |
//! | `Parse`   | log and drop the frame, keep the connection open      |
//! | `Network` | bounded backoff reconnect                             |
//! | `Timeout` | mark the optimistic message failed, never auto-retry  |
//! | `Storage` | log, never block logout                               |
//! | `Auth`    | refresh the credential before reconnecting            |

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Categories
// ─────────────────────────────────────────────────────────────────────────────

/// Error category for classification and status reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credential could not be decoded or its claims are inconsistent.
    Decode,
    /// Inbound frame did not satisfy the wire contract.
    Parse,
    /// Transport failure (unexpected close, refused handshake, I/O).
    Network,
    /// An optimistic message was not confirmed in time.
    Timeout,
    /// Persistent or shared storage failed.
    Storage,
    /// The backend rejected the credential.
    Auth,
}

impl ErrorCategory {
    /// Whether errors in this category are recovered by reconnecting.
    #[must_use]
    pub fn triggers_reconnect(self) -> bool {
        matches!(self, Self::Network | Self::Auth)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode => write!(f, "decode"),
            Self::Parse => write!(f, "parse"),
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::Storage => write!(f, "storage"),
            Self::Auth => write!(f, "auth"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame errors
// ─────────────────────────────────────────────────────────────────────────────

/// Why an inbound frame was rejected.
///
/// All variants are [`ErrorCategory::Parse`]: recoverable, never fatal to
/// the connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame text was not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),

    /// The frame was JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The `type` discriminator is missing, empty, or not a string.
    #[error("frame is missing its `type` discriminator")]
    MissingType,

    /// The `payload` field is missing or not an object.
    #[error("frame `{frame_type}` is missing its `payload` object")]
    MissingPayload {
        /// The discriminator of the offending frame.
        frame_type: String,
    },

    /// A known frame type carried a payload with missing/invalid fields.
    #[error("frame `{frame_type}` has an invalid payload: {reason}")]
    InvalidPayload {
        /// The discriminator of the offending frame.
        frame_type: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl FrameError {
    /// Classification of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Parse
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
