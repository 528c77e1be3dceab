//! Cross-tab session sync.
//!
//! When another tab of the same origin removes (or empties) one of the
//! authentication keys in shared storage, this tab signs out too. A burst
//! of such events produces one logout: a guard flag is held for the
//! duration of the logout and events arriving meanwhile, or after the
//! context is already signed out, are skipped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::{LogoutReason, SessionContext};
use crate::storage::{StorageEvent, TabStorage};

struct Inner {
    context: Arc<SessionContext>,
    storage: TabStorage,
    auth_keys: HashSet<String>,
    guard: AtomicBool,
    listener: Mutex<Option<CancellationToken>>,
}

/// Mirrors logout across tabs sharing one origin.
#[derive(Clone)]
pub struct SessionSyncBroadcaster {
    inner: Arc<Inner>,
}

impl SessionSyncBroadcaster {
    /// Broadcaster signing `context` out when any of `auth_keys` is removed.
    pub fn new<I, S>(context: Arc<SessionContext>, storage: TabStorage, auth_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(Inner {
                context,
                storage,
                auth_keys: auth_keys.into_iter().map(Into::into).collect(),
                guard: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Start listening. Returns `false` when already installed.
    pub fn install(&self) -> bool {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let mut events = self.inner.storage.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let token = cancel.clone();
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        SessionSyncBroadcaster { inner }.handle_event(event).await;
                    }
                }
            }
            debug!("session sync listener stopped");
        });

        *listener = Some(cancel);
        debug!(tab = %self.inner.storage.tab_id(), "session sync installed");
        true
    }

    /// Stop listening. Returns `false` when nothing was installed.
    pub fn uninstall(&self) -> bool {
        let Some(cancel) = self.inner.listener.lock().take() else {
            return false;
        };
        cancel.cancel();
        debug!(tab = %self.inner.storage.tab_id(), "session sync uninstalled");
        true
    }

    /// Whether the listener is running.
    pub fn is_installed(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    /// Whether `event` means another tab signed out.
    pub fn is_qualifying(&self, event: &StorageEvent) -> bool {
        event.key.as_ref().is_some_and(|key| self.inner.auth_keys.contains(key))
            && event.new_value.as_deref().is_none_or(str::is_empty)
    }

    /// React to one storage event.
    pub async fn handle_event(&self, event: StorageEvent) {
        if event.key.is_none() {
            debug!(origin = %event.origin_tab_id, "ignoring storage event without key");
            return;
        }
        if !self.is_qualifying(&event) {
            return;
        }
        if !self.inner.context.is_authenticated() {
            debug!(key = ?event.key, "already signed out, ignoring");
            return;
        }
        if self
            .inner
            .guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(key = ?event.key, "logout already in progress");
            return;
        }

        info!(key = ?event.key, origin = %event.origin_tab_id, "signed out in another tab");
        let _ = self.inner.context.logout(LogoutReason::CrossTab).await;
        self.inner.guard.store(false, Ordering::SeqCst);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cancel) = self.listener.get_mut().take() {
            cancel.cancel();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
