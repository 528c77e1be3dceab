//! Explicit per-tab session context.
//!
//! Owns the authenticated flag and the current access token and is handed
//! (as `Arc<SessionContext>`) to everything that needs them. Token changes
//! are published on a `watch` channel; sign-in and sign-out are announced
//! on a broadcast channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tether_auth::{AuthError, CredentialStore, LogoutBackend, TokenRefresher, refresh_stored_credential};
use tether_core::TabId;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Why a logout happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    /// The user asked for it.
    UserInitiated,
    /// Another tab of the same origin signed out.
    CrossTab,
    /// The backend refused to refresh the credential.
    CredentialRejected,
}

/// Outcome of the backend half of a logout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendLogout {
    /// No backend configured, no token, or a cross-tab follower.
    Skipped,
    /// Backend acknowledged.
    Succeeded,
    /// Backend call failed; the local logout stands.
    Failed(String),
}

/// What a logout did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutReport {
    /// Whether the context was signed in beforehand.
    pub was_authenticated: bool,
    /// Whether stored credentials were removed.
    pub storage_cleared: bool,
    /// Backend outcome.
    pub backend: BackendLogout,
}

/// Sign-in state changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Credentials were installed.
    SignedIn,
    /// The context signed out.
    SignedOut(LogoutReason),
}

/// Authentication state of one client context.
pub struct SessionContext {
    tab_id: TabId,
    store: Arc<dyn CredentialStore>,
    logout_backend: Option<Arc<dyn LogoutBackend>>,
    authenticated: AtomicBool,
    token_tx: watch::Sender<Option<String>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionContext {
    /// Signed-out context over `store`. Call [`hydrate`](Self::hydrate) to
    /// pick up a stored credential.
    pub fn new(tab_id: TabId, store: Arc<dyn CredentialStore>) -> Self {
        let (token_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(16);
        Self {
            tab_id,
            store,
            logout_backend: None,
            authenticated: AtomicBool::new(false),
            token_tx,
            events_tx,
        }
    }

    /// Attach a backend logout endpoint.
    #[must_use]
    pub fn with_logout_backend(mut self, backend: Arc<dyn LogoutBackend>) -> Self {
        self.logout_backend = Some(backend);
        self
    }

    /// Owning tab.
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Credential store.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Load a stored credential, signing in when one exists.
    pub fn hydrate(&self) -> Result<Option<String>, AuthError> {
        let token = self.store.get_token()?;
        if let Some(token) = &token {
            debug!(tab = %self.tab_id, "hydrated stored credential");
            self.mark_signed_in(token.clone());
        }
        Ok(token)
    }

    /// Install fresh credentials.
    pub fn login(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), AuthError> {
        self.store.set_token(access_token)?;
        if let Some(refresh_token) = refresh_token {
            self.store.set_refresh_token(refresh_token)?;
        }
        info!(tab = %self.tab_id, "signed in");
        self.mark_signed_in(access_token.to_string());
        Ok(())
    }

    /// Replace the access token of a signed-in context.
    pub fn update_token(&self, token: &str) -> Result<(), AuthError> {
        if !self.is_authenticated() {
            return Err(AuthError::NotConfigured("session is signed out".into()));
        }
        self.store.set_token(token)?;
        let _ = self.token_tx.send_replace(Some(token.to_string()));
        Ok(())
    }

    /// Refresh through `refresher` and publish the new token.
    ///
    /// A refresh that completes after sign-out is discarded.
    pub async fn refresh_with(&self, refresher: &dyn TokenRefresher) -> Result<String, AuthError> {
        let token = refresh_stored_credential(refresher, self.store.as_ref()).await?;
        if self.is_authenticated() {
            let _ = self.token_tx.send_replace(Some(token.clone()));
        } else {
            debug!("refresh completed after sign-out, discarding token");
        }
        Ok(token)
    }

    /// Whether the context is signed in.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Current access token.
    pub fn token(&self) -> Option<String> {
        self.token_tx.borrow().clone()
    }

    /// Watch the current access token.
    pub fn subscribe_token(&self) -> watch::Receiver<Option<String>> {
        self.token_tx.subscribe()
    }

    /// Sign-in / sign-out notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Sign out.
    ///
    /// The local flag and published token clear first, then stored
    /// credentials, then the backend is told. Storage and backend failures
    /// are logged and never undo the local sign-out.
    #[tracing::instrument(skip_all, fields(tab = %self.tab_id, reason = ?reason))]
    pub async fn logout(&self, reason: LogoutReason) -> LogoutReport {
        let token = self.token();
        let was_authenticated = self.authenticated.swap(false, Ordering::SeqCst);
        let _ = self.token_tx.send_replace(None);
        if was_authenticated {
            info!("signed out locally");
            let _ = self.events_tx.send(SessionEvent::SignedOut(reason));
        }

        let storage_cleared = match self.store.remove_token() {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, category = %error.category(), "credential cleanup failed during logout");
                false
            }
        };

        let backend = match (&self.logout_backend, token) {
            (Some(backend), Some(token)) if reason != LogoutReason::CrossTab => {
                match backend.logout(&token).await {
                    Ok(()) => BackendLogout::Succeeded,
                    Err(err) => {
                        error!(error = %err, "backend logout failed; local session remains signed out");
                        BackendLogout::Failed(err.to_string())
                    }
                }
            }
            _ => BackendLogout::Skipped,
        };

        LogoutReport {
            was_authenticated,
            storage_cleared,
            backend,
        }
    }

    fn mark_signed_in(&self, token: String) {
        let was_authenticated = self.authenticated.swap(true, Ordering::SeqCst);
        let _ = self.token_tx.send_replace(Some(token));
        if !was_authenticated {
            let _ = self.events_tx.send(SessionEvent::SignedIn);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingCredentialStore, RecordingLogoutBackend};
    use assert_matches::assert_matches;
    use tether_auth::MemoryCredentialStore;
    use tether_core::logging::capture_logs;
    use tracing::Level;

    fn context(store: Arc<dyn CredentialStore>) -> SessionContext {
        SessionContext::new(TabId::from("tab"), store)
    }

    #[test]
    fn hydrate_signs_in_from_store() {
        let ctx = context(Arc::new(MemoryCredentialStore::with_token("t")));
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.hydrate().unwrap().as_deref(), Some("t"));
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.token().as_deref(), Some("t"));
    }

    #[test]
    fn hydrate_empty_stays_signed_out() {
        let ctx = context(Arc::new(MemoryCredentialStore::new()));
        assert_eq!(ctx.hydrate().unwrap(), None);
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn update_token_requires_sign_in() {
        let ctx = context(Arc::new(MemoryCredentialStore::new()));
        assert_matches!(ctx.update_token("t"), Err(AuthError::NotConfigured(_)));
        ctx.login("a", Some("r")).unwrap();
        ctx.update_token("b").unwrap();
        assert_eq!(ctx.token().as_deref(), Some("b"));
        assert_eq!(ctx.store().get_token().unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn logout_clears_flag_store_and_calls_backend() {
        let backend = Arc::new(RecordingLogoutBackend::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let ctx = context(store.clone()).with_logout_backend(backend.clone());
        ctx.login("tok", None).unwrap();
        let mut events = ctx.subscribe_events();

        let report = ctx.logout(LogoutReason::UserInitiated).await;
        assert!(report.was_authenticated);
        assert!(report.storage_cleared);
        assert_eq!(report.backend, BackendLogout::Succeeded);
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.token(), None);
        assert_eq!(store.get_token().unwrap(), None);
        assert_eq!(backend.calls(), vec!["tok".to_string()]);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignedOut(LogoutReason::UserInitiated)
        );
    }

    #[tokio::test]
    async fn storage_failure_does_not_block_logout() {
        let (logs, _guard) = capture_logs();
        let backend = Arc::new(RecordingLogoutBackend::new());
        let ctx = context(Arc::new(FailingCredentialStore::with_token("tok")))
            .with_logout_backend(backend.clone());
        let _ = ctx.hydrate().unwrap();

        let report = ctx.logout(LogoutReason::UserInitiated).await;
        assert!(!ctx.is_authenticated());
        assert!(!report.storage_cleared);
        assert_eq!(report.backend, BackendLogout::Succeeded);
        assert!(logs.has_event(Level::WARN, "credential cleanup failed"));
    }

    #[tokio::test]
    async fn backend_failure_is_logged_loudly_and_not_reversed() {
        let (logs, _guard) = capture_logs();
        let backend = Arc::new(RecordingLogoutBackend::failing());
        let ctx = context(Arc::new(MemoryCredentialStore::new())).with_logout_backend(backend);
        ctx.login("tok", None).unwrap();

        let report = ctx.logout(LogoutReason::UserInitiated).await;
        assert_matches!(report.backend, BackendLogout::Failed(_));
        assert!(!ctx.is_authenticated());
        assert!(logs.has_event(Level::ERROR, "backend logout failed"));
    }

    #[tokio::test]
    async fn cross_tab_logout_skips_backend() {
        let backend = Arc::new(RecordingLogoutBackend::new());
        let ctx = context(Arc::new(MemoryCredentialStore::new()))
            .with_logout_backend(backend.clone());
        ctx.login("tok", None).unwrap();

        let report = ctx.logout(LogoutReason::CrossTab).await;
        assert_eq!(report.backend, BackendLogout::Skipped);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn logout_when_signed_out_is_quiet() {
        let ctx = context(Arc::new(MemoryCredentialStore::new()));
        let mut events = ctx.subscribe_events();
        let report = ctx.logout(LogoutReason::UserInitiated).await;
        assert!(!report.was_authenticated);
        assert!(events.try_recv().is_err());
    }
}
