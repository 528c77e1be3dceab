//! Optimistic message reconciliation.
//!
//! Locally created messages are shown immediately as pending and resolved
//! when the server echoes them back (`message.created`), refuses them
//! (`message.rejected`), or their confirmation timeout elapses. Entries are
//! kept in creation order; server timestamps are delivery metadata only.
//!
//! All state sits behind one `parking_lot::Mutex`. Timer tasks (per-message
//! timeouts and the retention sweep) hold only a `Weak` reference, so they
//! end once the service is dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tether_core::{
    ErrorCategory, InboundMessage, LocalMessageId, MessageDraft, MessageSnapshot, MessageStatus,
    OptimisticMessage, Rejection, ServerMessageId,
};
use tether_settings::ReconciliationSettings;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error recorded on a message whose confirmation never arrived.
pub const TIMEOUT_REASON: &str = "confirmation timed out";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Timers used by [`ReconciliationService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciliationConfig {
    /// How long a message may stay pending.
    pub confirmation_timeout: Duration,
    /// Interval between retention sweeps.
    pub sweep_interval: Duration,
    /// How long confirmed and superseded entries are kept.
    pub retention: Duration,
    /// Maximum age of a pending entry eligible for fingerprint matching.
    pub fingerprint_window: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self::from_settings(&ReconciliationSettings::default())
    }
}

impl ReconciliationConfig {
    /// Build from the settings section.
    pub fn from_settings(settings: &ReconciliationSettings) -> Self {
        Self {
            confirmation_timeout: Duration::from_millis(settings.confirmation_timeout_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            retention: Duration::from_millis(settings.retention_ms),
            fingerprint_window: Duration::from_millis(settings.fingerprint_window_ms),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

struct Entry {
    message: OptimisticMessage,
    /// Created through `add_optimistic_message` (as opposed to received).
    is_local: bool,
    status: MessageStatus,
    created: Instant,
    resolved: Option<Instant>,
    delivered_at: Option<DateTime<Utc>>,
    error: Option<String>,
    timeout: Option<JoinHandle<()>>,
}

impl Entry {
    fn resolve(&mut self, status: MessageStatus, now: Instant) {
        self.status = status;
        self.resolved = Some(now);
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }

    fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            local_id: self.is_local.then(|| self.message.local_id.clone()),
            server_id: self.message.server_confirmation_id.clone(),
            content: self.message.content.clone(),
            role: self.message.role,
            status: self.status,
            created_at: self.message.created_at,
            delivered_at: self.delivered_at,
            error: self.error.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    next_seq: u64,
    /// Keyed by creation sequence, which is display order.
    entries: BTreeMap<u64, Entry>,
    by_local: HashMap<LocalMessageId, u64>,
    seen_server_ids: HashSet<ServerMessageId>,
}

impl State {
    fn insert(&mut self, entry: Entry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.by_local.insert(entry.message.local_id.clone(), seq);
        let _ = self.entries.insert(seq, entry);
        seq
    }

    fn remove(&mut self, seq: u64) -> Option<Entry> {
        let entry = self.entries.remove(&seq)?;
        let _ = self.by_local.remove(&entry.message.local_id);
        if let Some(server_id) = &entry.message.server_confirmation_id {
            let _ = self.seen_server_ids.remove(server_id);
        }
        if let Some(timeout) = &entry.timeout {
            timeout.abort();
        }
        Some(entry)
    }

    fn entry_mut(&mut self, id: &LocalMessageId) -> Option<&mut Entry> {
        let seq = *self.by_local.get(id)?;
        self.entries.get_mut(&seq)
    }
}

struct Shared {
    config: ReconciliationConfig,
    state: Mutex<State>,
    revision: watch::Sender<u64>,
    sweeper_started: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// Owns every displayed message and resolves optimistic ones.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ReconciliationService {
    shared: Arc<Shared>,
}

impl Default for ReconciliationService {
    fn default() -> Self {
        Self::new(ReconciliationConfig::default())
    }
}

impl ReconciliationService {
    /// Empty service.
    pub fn new(config: ReconciliationConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                revision,
                sweeper_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ReconciliationConfig {
        &self.shared.config
    }

    /// Show `draft` as pending and start its confirmation timeout.
    ///
    /// Adding a draft whose `local_id` is already known returns the existing
    /// message unchanged.
    pub fn add_optimistic_message(&self, draft: MessageDraft) -> OptimisticMessage {
        let local_id = draft.local_id.unwrap_or_default();
        let mut state = self.shared.state.lock();
        if let Some(existing) = state.entry_mut(&local_id) {
            debug!(local_id = %local_id, "optimistic message already tracked");
            return existing.message.clone();
        }

        let message = OptimisticMessage {
            local_id: local_id.clone(),
            content: draft.content,
            role: draft.role,
            created_at: Utc::now(),
            server_confirmation_id: None,
        };
        let timeout = self.spawn_timeout(local_id.clone());
        let _ = state.insert(Entry {
            message: message.clone(),
            is_local: true,
            status: MessageStatus::Pending,
            created: Instant::now(),
            resolved: None,
            delivered_at: None,
            error: None,
            timeout,
        });
        drop(state);

        debug!(local_id = %local_id, "optimistic message added");
        self.shared.bump();
        message
    }

    /// Resolve a `message.created` event.
    ///
    /// Returns the local id of the optimistic message it confirmed, or `None`
    /// when it confirmed nothing: a duplicate delivery, a late echo of an
    /// already-failed message, or a message that originated elsewhere (which
    /// is appended as confirmed).
    pub fn process_confirmation(&self, inbound: &InboundMessage) -> Option<LocalMessageId> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        if state.seen_server_ids.contains(&inbound.server_id) {
            debug!(server_id = %inbound.server_id, "duplicate confirmation ignored");
            return None;
        }

        let matched = match &inbound.correlation_id {
            Some(correlation_id) => state.by_local.get(correlation_id).copied(),
            None => self.fingerprint_match(&state, inbound, now),
        };

        let result = match matched {
            Some(seq) => {
                let Some(entry) = state.entries.get_mut(&seq) else {
                    return None;
                };
                if entry.status.is_resolved() {
                    debug!(
                        local_id = %entry.message.local_id,
                        status = ?entry.status,
                        "confirmation for resolved message ignored"
                    );
                    return None;
                }
                entry.resolve(MessageStatus::Confirmed, now);
                entry.message.server_confirmation_id = Some(inbound.server_id.clone());
                entry.delivered_at = inbound.timestamp;
                let local_id = entry.message.local_id.clone();
                debug!(local_id = %local_id, server_id = %inbound.server_id, "message confirmed");
                Some(local_id)
            }
            None => {
                let local_id = inbound.correlation_id.clone().unwrap_or_default();
                let _ = state.insert(Entry {
                    message: OptimisticMessage {
                        local_id,
                        content: inbound.content.clone(),
                        role: inbound.role,
                        created_at: Utc::now(),
                        server_confirmation_id: Some(inbound.server_id.clone()),
                    },
                    is_local: false,
                    status: MessageStatus::Confirmed,
                    created: now,
                    resolved: Some(now),
                    delivered_at: inbound.timestamp,
                    error: None,
                    timeout: None,
                });
                debug!(server_id = %inbound.server_id, "remote message appended");
                None
            }
        };
        let _ = state.seen_server_ids.insert(inbound.server_id.clone());
        drop(state);

        self.shared.bump();
        result
    }

    /// Oldest pending local entry with the same role and content, created
    /// within the fingerprint window.
    fn fingerprint_match(&self, state: &State, inbound: &InboundMessage, now: Instant) -> Option<u64> {
        let window = self.shared.config.fingerprint_window;
        state
            .entries
            .iter()
            .find(|(_, entry)| {
                entry.is_local
                    && entry.status == MessageStatus::Pending
                    && now.duration_since(entry.created) <= window
                    && inbound.fingerprint_matches(&entry.message)
            })
            .map(|(seq, _)| *seq)
    }

    /// Resolve a `message.rejected` event. Returns whether a pending message
    /// was superseded.
    pub fn process_rejection(&self, rejection: &Rejection) -> bool {
        let reason = rejection
            .reason
            .clone()
            .unwrap_or_else(|| "rejected by server".to_string());
        let changed = self.resolve_pending(&rejection.correlation_id, MessageStatus::Superseded, reason);
        if changed {
            debug!(local_id = %rejection.correlation_id, "message superseded");
        }
        changed
    }

    /// Fail a pending message, e.g. because its frame could not be sent.
    pub fn mark_failed(&self, local_id: &LocalMessageId, reason: &str) -> bool {
        let changed = self.resolve_pending(local_id, MessageStatus::Failed, reason.to_string());
        if changed {
            warn!(local_id = %local_id, %reason, "message failed");
        }
        changed
    }

    /// Fail a message whose confirmation timeout elapsed.
    pub fn expire(&self, local_id: &LocalMessageId) -> bool {
        let changed = self.resolve_pending(local_id, MessageStatus::Failed, TIMEOUT_REASON.to_string());
        if changed {
            warn!(
                local_id = %local_id,
                category = %ErrorCategory::Timeout,
                "message confirmation timed out"
            );
        }
        changed
    }

    fn resolve_pending(&self, local_id: &LocalMessageId, status: MessageStatus, reason: String) -> bool {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.entry_mut(local_id) else {
            return false;
        };
        if entry.status != MessageStatus::Pending {
            return false;
        }
        entry.resolve(status, Instant::now());
        entry.error = Some(reason);
        drop(state);
        self.shared.bump();
        true
    }

    /// Dismiss one failed message.
    pub fn clear_failed(&self, local_id: &LocalMessageId) -> bool {
        let mut state = self.shared.state.lock();
        let seq = match state.by_local.get(local_id) {
            Some(seq) if state.entries.get(seq).is_some_and(|e| e.status == MessageStatus::Failed) => *seq,
            _ => return false,
        };
        let _ = state.remove(seq);
        drop(state);
        self.shared.bump();
        true
    }

    /// Dismiss every failed message. Returns how many were removed.
    pub fn clear_all_failed(&self) -> usize {
        let mut state = self.shared.state.lock();
        let failed: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, e)| e.status == MessageStatus::Failed)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &failed {
            let _ = state.remove(*seq);
        }
        drop(state);
        if !failed.is_empty() {
            self.shared.bump();
        }
        failed.len()
    }

    /// Drop confirmed and superseded entries older than the retention
    /// window, and fail pending entries whose timeout has passed without
    /// their timer firing. Failed entries are kept. Returns how many entries
    /// were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.shared.config.retention;
        let timeout = self.shared.config.confirmation_timeout;

        let mut state = self.shared.state.lock();
        let mut expired = 0usize;
        for entry in state.entries.values_mut() {
            if entry.status == MessageStatus::Pending && now.duration_since(entry.created) >= timeout {
                entry.resolve(MessageStatus::Failed, now);
                entry.error = Some(TIMEOUT_REASON.to_string());
                expired += 1;
            }
        }
        let stale: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, e)| {
                matches!(e.status, MessageStatus::Confirmed | MessageStatus::Superseded)
                    && e.resolved.is_some_and(|at| now.duration_since(at) >= retention)
            })
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &stale {
            let _ = state.remove(*seq);
        }
        drop(state);

        if expired > 0 {
            warn!(count = expired, category = %ErrorCategory::Timeout, "sweep failed overdue messages");
        }
        if expired > 0 || !stale.is_empty() {
            debug!(removed = stale.len(), "reconciliation sweep");
            self.shared.bump();
        }
        stale.len()
    }

    /// Every displayed message in creation order.
    pub fn snapshot(&self) -> Vec<MessageSnapshot> {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .map(Entry::snapshot)
            .collect()
    }

    /// Pending optimistic messages in creation order.
    pub fn pending(&self) -> Vec<OptimisticMessage> {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.status == MessageStatus::Pending)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Number of pending messages.
    pub fn pending_count(&self) -> usize {
        self.count(MessageStatus::Pending)
    }

    /// Number of failed messages.
    pub fn failed_count(&self) -> usize {
        self.count(MessageStatus::Failed)
    }

    fn count(&self, status: MessageStatus) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    /// Total displayed messages.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Whether nothing is displayed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revision counter bumped on every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Start the periodic retention sweep. Only the first call spawns it.
    pub fn start_sweeper(&self) -> bool {
        if self.shared.sweeper_started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let weak = Arc::downgrade(&self.shared);
        let cancel = self.shared.cancel.clone();
        let period = self.shared.config.sweep_interval;
        let _ = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        let _ = ReconciliationService { shared }.sweep();
                    }
                }
            }
            debug!("reconciliation sweeper stopped");
        });
        true
    }

    /// Stop the sweeper and every pending timeout timer.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        let state = self.shared.state.lock();
        for entry in state.entries.values() {
            if let Some(timeout) = &entry.timeout {
                timeout.abort();
            }
        }
    }

    /// Spawn the per-message timeout, if a runtime is available. Without
    /// one the sweep fails overdue messages instead.
    fn spawn_timeout(&self, local_id: LocalMessageId) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let delay = self.shared.config.confirmation_timeout;
        Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                let _ = ReconciliationService { shared }.expire(&local_id);
            }
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
