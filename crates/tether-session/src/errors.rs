//! Session error types.

use tether_auth::AuthError;
use tether_core::ErrorCategory;

/// Errors raised while establishing a transport connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connect request could not be built (bad URL or header).
    #[error("invalid connect request: {0}")]
    InvalidRequest(String),

    /// The server refused the upgrade with an HTTP status.
    #[error("handshake refused with HTTP {status}")]
    HandshakeRefused {
        /// HTTP status of the refusal.
        status: u16,
    },

    /// The socket failed to connect or broke.
    #[error("connection failed: {0}")]
    Connect(String),
}

impl TransportError {
    /// Whether the failure means the credential was not accepted.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::HandshakeRefused { status } if is_auth_rejection_status(*status))
    }

    /// Category used for status reporting.
    pub fn category(&self) -> ErrorCategory {
        if self.is_auth_rejection() {
            ErrorCategory::Auth
        } else {
            ErrorCategory::Network
        }
    }
}

/// HTTP statuses that mean "the credential was refused".
pub fn is_auth_rejection_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// Application close codes that mean "the credential was refused".
pub fn is_auth_close_code(code: u16) -> bool {
    matches!(code, 4401 | 4403)
}

/// Errors surfaced by [`crate::ChatSession`] entry points.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Credential handling failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The session has been shut down.
    #[error("session is shut down")]
    ShutDown,
}

impl SessionError {
    /// Category used for status reporting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(e) => e.category(),
            Self::ShutDown => ErrorCategory::Network,
        }
    }
}
