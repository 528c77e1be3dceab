//! Credential persistence.
//!
//! [`CredentialStore`] is the seam between session code and wherever tokens
//! live. [`FileCredentialStore`] writes `~/.tether/credentials.json` with
//! 0o600 permissions; [`MemoryCredentialStore`] keeps them in process.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::AuthError;

/// Default credentials file name.
const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Storage for the access token and its refresh token.
pub trait CredentialStore: Send + Sync {
    /// Current access token.
    fn get_token(&self) -> Result<Option<String>, AuthError>;
    /// Replace the access token.
    fn set_token(&self, token: &str) -> Result<(), AuthError>;
    /// Remove the access token and refresh token.
    fn remove_token(&self) -> Result<(), AuthError>;
    /// Current refresh token.
    fn get_refresh_token(&self) -> Result<Option<String>, AuthError>;
    /// Replace the refresh token.
    fn set_refresh_token(&self, token: &str) -> Result<(), AuthError>;
}

/// Persisted token pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    /// Storage format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// RFC 3339 time of the last write.
    #[serde(default)]
    pub last_updated: String,
}

fn default_version() -> u32 {
    1
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<StoredCredentials>,
}

impl MemoryCredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with an access token.
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::default();
        store.inner.lock().access_token = Some(token.into());
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.inner.lock().access_token.clone())
    }

    fn set_token(&self, token: &str) -> Result<(), AuthError> {
        self.inner.lock().access_token = Some(token.to_string());
        Ok(())
    }

    fn remove_token(&self) -> Result<(), AuthError> {
        let mut inner = self.inner.lock();
        inner.access_token = None;
        inner.refresh_token = None;
        Ok(())
    }

    fn get_refresh_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.inner.lock().refresh_token.clone())
    }

    fn set_refresh_token(&self, token: &str) -> Result<(), AuthError> {
        self.inner.lock().refresh_token = Some(token.to_string());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File store
// ─────────────────────────────────────────────────────────────────────────────

/// Get the credentials file path under the given data directory.
pub fn credentials_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CREDENTIALS_FILE_NAME)
}

/// JSON file store.
///
/// Unreadable or unparseable files are treated as empty and logged.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> StoredCredentials {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return StoredCredentials::default();
            }
            Err(e) => {
                tracing::warn!("failed to read credentials file: {e}");
                return StoredCredentials::default();
            }
        };

        match serde_json::from_str::<StoredCredentials>(&data) {
            Ok(stored) if stored.version == 1 => stored,
            Ok(stored) => {
                tracing::warn!("unsupported credentials version: {}", stored.version);
                StoredCredentials::default()
            }
            Err(e) => {
                tracing::warn!("failed to parse credentials file: {e}");
                StoredCredentials::default()
            }
        }
    }

    fn save(&self, stored: &mut StoredCredentials) -> Result<(), AuthError> {
        stored.version = 1;
        stored.last_updated = chrono::Utc::now().to_rfc3339();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(stored)?;
        std::fs::write(&self.path, &json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.path, perms);
        }

        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut StoredCredentials)) -> Result<(), AuthError> {
        let _guard = self.write_lock.lock();
        let mut stored = self.load();
        f(&mut stored);
        self.save(&mut stored)
    }
}

impl CredentialStore for FileCredentialStore {
    fn get_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.load().access_token)
    }

    fn set_token(&self, token: &str) -> Result<(), AuthError> {
        self.update(|s| s.access_token = Some(token.to_string()))
    }

    fn remove_token(&self) -> Result<(), AuthError> {
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_refresh_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.load().refresh_token)
    }

    fn set_refresh_token(&self, token: &str) -> Result<(), AuthError> {
        self.update(|s| s.refresh_token = Some(token.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
