//! # tether-auth
//!
//! Credential handling for the tether session layer.
//!
//! - [`credential`]: decode JWT-shaped tokens into [`Credential`] claims
//! - [`lifecycle`]: [`TokenLifecycleManager`], the refresh policy
//! - [`scheduler`]: [`RefreshScheduler`], a cancellable timer task that
//!   signals when the current token is due
//! - [`refresh`]: [`TokenRefresher`] and its HTTP implementation
//! - [`logout`]: [`LogoutBackend`], best-effort server-side logout
//! - [`store`]: [`CredentialStore`] with memory and file backends
//!
//! File-backed credentials live in `~/.tether/credentials.json` with 0o600
//! permissions.

#![deny(unsafe_code)]

pub mod credential;
pub mod errors;
pub mod lifecycle;
pub mod logout;
pub mod refresh;
pub mod scheduler;
pub mod store;

pub use credential::{Credential, encode_unsigned_token, now_secs};
pub use errors::AuthError;
pub use lifecycle::{LifecycleConfig, RefreshDiagnostics, TokenLifecycleManager};
pub use logout::{HttpLogoutBackend, LogoutBackend};
pub use refresh::{HttpTokenRefresher, RefreshedTokens, TokenRefresher, refresh_stored_credential};
pub use scheduler::{RefreshDue, RefreshScheduler};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoredCredentials};
