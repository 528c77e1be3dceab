//! Origin-scoped shared key-value storage.
//!
//! [`SharedStorage`] is one origin's store; every open client context gets a
//! [`TabStorage`] view over it. A mutation through one view is announced as
//! a [`StorageEvent`] to every *other* view of the same origin, never to the
//! writer. `clear()` announces a single event with no key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_auth::{AuthError, CredentialStore};
use tether_core::TabId;
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the per-origin event channel.
const EVENT_CAPACITY: usize = 256;

/// A mutation observed on shared storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    /// Key that changed; `None` when the whole store was cleared.
    pub key: Option<String>,
    /// Value before the change.
    pub old_value: Option<String>,
    /// Value after the change; `None` when removed.
    pub new_value: Option<String>,
    /// Tab that made the change.
    pub origin_tab_id: TabId,
}

/// One origin's storage, shared by all of its tabs.
#[derive(Clone)]
pub struct SharedStorage {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    values: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStorage {
    /// Empty storage.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SharedInner {
                values: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// View for a tab.
    pub fn tab(&self, tab_id: TabId) -> TabStorage {
        TabStorage {
            tab_id,
            shared: self.clone(),
        }
    }

    /// Deliver an event that originated outside this process's views.
    ///
    /// The stored values are not touched.
    pub fn dispatch(&self, event: StorageEvent) {
        let _ = self.inner.events.send(event);
    }

    fn announce(&self, event: StorageEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// A tab's view over [`SharedStorage`].
#[derive(Clone)]
pub struct TabStorage {
    tab_id: TabId,
    shared: SharedStorage,
}

impl TabStorage {
    /// Owning tab.
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.shared.inner.values.lock().get(key).cloned()
    }

    /// Store `value` under `key`. Other tabs are notified when it changed.
    pub fn set(&self, key: &str, value: &str) {
        let old_value = self
            .shared
            .inner
            .values
            .lock()
            .insert(key.to_string(), value.to_string());
        if old_value.as_deref() != Some(value) {
            self.shared.announce(StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: Some(value.to_string()),
                origin_tab_id: self.tab_id.clone(),
            });
        }
    }

    /// Remove `key`. Other tabs are notified when it existed.
    pub fn remove(&self, key: &str) {
        let old_value = self.shared.inner.values.lock().remove(key);
        if old_value.is_some() {
            self.shared.announce(StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: None,
                origin_tab_id: self.tab_id.clone(),
            });
        }
    }

    /// Remove every key. Other tabs see one event with no key.
    pub fn clear(&self) {
        let was_empty = {
            let mut values = self.shared.inner.values.lock();
            let was_empty = values.is_empty();
            values.clear();
            was_empty
        };
        if !was_empty {
            self.shared.announce(StorageEvent {
                key: None,
                old_value: None,
                new_value: None,
                origin_tab_id: self.tab_id.clone(),
            });
        }
    }

    /// Events caused by other tabs.
    pub fn subscribe(&self) -> StorageSubscription {
        StorageSubscription {
            tab_id: self.tab_id.clone(),
            rx: self.shared.inner.events.subscribe(),
        }
    }
}

/// Stream of other tabs' storage events.
pub struct StorageSubscription {
    tab_id: TabId,
    rx: broadcast::Receiver<StorageEvent>,
}

impl StorageSubscription {
    /// Next event from another tab; `None` once the storage is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin_tab_id == self.tab_id => {}
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "storage listener lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential store over shared storage
// ─────────────────────────────────────────────────────────────────────────────

/// [`CredentialStore`] kept in shared storage, so removal signs out other tabs.
pub struct StorageCredentialStore {
    storage: TabStorage,
    token_key: String,
    refresh_token_key: String,
}

impl StorageCredentialStore {
    /// Store using the given keys.
    pub fn new(
        storage: TabStorage,
        token_key: impl Into<String>,
        refresh_token_key: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            token_key: token_key.into(),
            refresh_token_key: refresh_token_key.into(),
        }
    }
}

impl CredentialStore for StorageCredentialStore {
    fn get_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.storage.get(&self.token_key))
    }

    fn set_token(&self, token: &str) -> Result<(), AuthError> {
        self.storage.set(&self.token_key, token);
        Ok(())
    }

    fn remove_token(&self) -> Result<(), AuthError> {
        self.storage.remove(&self.token_key);
        self.storage.remove(&self.refresh_token_key);
        Ok(())
    }

    fn get_refresh_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.storage.get(&self.refresh_token_key))
    }

    fn set_refresh_token(&self, token: &str) -> Result<(), AuthError> {
        self.storage.set(&self.refresh_token_key, token);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn two_tabs() -> (TabStorage, TabStorage) {
        let shared = SharedStorage::new();
        (shared.tab(TabId::from("a")), shared.tab(TabId::from("b")))
    }

    #[tokio::test]
    async fn writes_are_visible_to_all_tabs() {
        let (a, b) = two_tabs();
        a.set("k", "v");
        assert_eq!(b.get("k").as_deref(), Some("v"));
        b.remove("k");
        assert_eq!(a.get("k"), None);
    }

    #[tokio::test]
    async fn other_tab_receives_event_writer_does_not() {
        let (a, b) = two_tabs();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.set("auth_token", "t1");
        let event = b_events.recv().await.unwrap();
        assert_eq!(event.key.as_deref(), Some("auth_token"));
        assert_eq!(event.new_value.as_deref(), Some("t1"));
        assert_eq!(event.origin_tab_id.as_str(), "a");

        assert!(
            timeout(Duration::from_millis(20), a_events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn remove_and_clear_events() {
        let (a, b) = two_tabs();
        a.set("x", "1");
        let mut events = b.subscribe();

        a.remove("x");
        a.remove("x");
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.old_value.as_deref(), Some("1"));
        assert_eq!(removed.new_value, None);

        a.set("y", "2");
        let _ = events.recv().await.unwrap();
        a.clear();
        let cleared = events.recv().await.unwrap();
        assert_eq!(cleared.key, None);
    }

    #[tokio::test]
    async fn unchanged_set_is_silent() {
        let (a, b) = two_tabs();
        a.set("k", "v");
        let mut events = b.subscribe();
        a.set("k", "v");
        assert!(
            timeout(Duration::from_millis(20), events.recv())
                .await
                .is_err()
        );
    }

    #[test]
    fn credential_store_over_storage() {
        let (a, b) = two_tabs();
        let store = StorageCredentialStore::new(a, "auth_token", "refresh_token");
        store.set_token("t").unwrap();
        store.set_refresh_token("r").unwrap();
        assert_eq!(b.get("auth_token").as_deref(), Some("t"));

        store.remove_token().unwrap();
        assert_eq!(store.get_token().unwrap(), None);
        assert_eq!(b.get("refresh_token"), None);
    }
}
