//! Session facade.
//!
//! [`ChatSession`] wires one client context together: the connection
//! manager, reconciliation, cross-tab sync and the refresh scheduler. The
//! UI talks only to this type.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tether_auth::{LifecycleConfig, RefreshDue, RefreshScheduler, TokenLifecycleManager, TokenRefresher};
use tether_core::{Frame, MessageDraft, MessageSnapshot, OptimisticMessage, ReconnectPolicy};
use tether_settings::ClientSettings;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::{LogoutReason, LogoutReport, SessionContext};
use crate::errors::SessionError;
use crate::manager::{ConnectionManager, ManagerConfig};
use crate::reconciliation::{ReconciliationConfig, ReconciliationService};
use crate::state::{ConnectionStatus, RefreshOutcome};
use crate::storage::TabStorage;
use crate::sync::SessionSyncBroadcaster;
use crate::transport::Transport;

/// Error recorded on a message that could not be handed to the transport.
pub const NOT_CONNECTED_REASON: &str = "not connected";

/// One tab's realtime chat session.
pub struct ChatSession {
    context: Arc<SessionContext>,
    manager: ConnectionManager,
    reconciliation: ReconciliationService,
    sync: SessionSyncBroadcaster,
    lifecycle: TokenLifecycleManager,
    refresh_check_interval: Duration,
    refresh_backoff: ReconnectPolicy,
    started: AtomicBool,
    shut_down: AtomicBool,
    scheduler_cancel: Mutex<Option<CancellationToken>>,
}

impl ChatSession {
    /// Assemble a session. Must be called inside a tokio runtime; nothing
    /// connects until [`start`](Self::start).
    pub fn new(
        settings: &ClientSettings,
        context: Arc<SessionContext>,
        storage: TabStorage,
        transport: Arc<dyn Transport>,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Self {
        let reconciliation =
            ReconciliationService::new(ReconciliationConfig::from_settings(&settings.reconciliation));
        let manager = ConnectionManager::new(
            ManagerConfig::from_settings(settings),
            transport,
            Arc::clone(&context),
            reconciliation.clone(),
            refresher,
        );
        let sync = SessionSyncBroadcaster::new(
            Arc::clone(&context),
            storage,
            settings.sync.auth_keys.iter().cloned(),
        );

        Self {
            context,
            manager,
            reconciliation,
            sync,
            lifecycle: TokenLifecycleManager::new(LifecycleConfig::from(&settings.auth)),
            refresh_check_interval: Duration::from_millis(settings.auth.refresh_check_interval_ms),
            refresh_backoff: settings.reconnect.clone(),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            scheduler_cancel: Mutex::new(None),
        }
    }

    /// Start background work and connect. Only the first call does
    /// anything; returns whether this call started the session.
    #[instrument(skip_all, fields(tab = %self.context.tab_id()))]
    pub fn start(&self) -> bool {
        if self.shut_down.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let _ = self.reconciliation.start_sweeper();
        let _ = self.sync.install();

        let cancel = CancellationToken::new();
        let outcomes = self.manager.subscribe_refresh();
        let (scheduler, due) = RefreshScheduler::spawn(
            self.lifecycle.clone(),
            self.context.subscribe_token(),
            self.refresh_check_interval,
            cancel.clone(),
        );
        let _ = tokio::spawn(forward_refreshes(
            self.manager.clone(),
            scheduler,
            due,
            outcomes,
            self.refresh_backoff.clone(),
            cancel.clone(),
        ));
        *self.scheduler_cancel.lock() = Some(cancel);

        self.manager.connect();
        info!("session started");
        true
    }

    /// Stop every background task and close the connection. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.scheduler_cancel.lock().take() {
            cancel.cancel();
        }
        let _ = self.sync.uninstall();
        self.reconciliation.shutdown();
        self.manager.shutdown();
        info!(tab = %self.context.tab_id(), "session shut down");
    }

    /// Install fresh credentials. A running session renegotiates (or
    /// reconnects) once the debounce window passes.
    pub fn login(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), SessionError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShutDown);
        }
        self.context.login(access_token, refresh_token)?;
        Ok(())
    }

    /// Sign out locally, then tell the backend. Always completes locally.
    pub async fn logout(&self) -> LogoutReport {
        self.context.logout(LogoutReason::UserInitiated).await
    }

    /// Show `content` immediately and send it, or queue it while
    /// connecting. The message fails at once if it can be neither sent nor
    /// queued.
    pub fn send_user_message(&self, content: &str) -> OptimisticMessage {
        let message = self
            .reconciliation
            .add_optimistic_message(MessageDraft::user(content));
        let frame = Frame::message_send(&message.local_id, &message.content, message.role);
        if !self.manager.queue(&frame) {
            let _ = self
                .reconciliation
                .mark_failed(&message.local_id, NOT_CONNECTED_REASON);
        }
        message
    }

    /// Connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    /// Watch connection status.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.subscribe_status()
    }

    /// Displayed messages in creation order.
    pub fn messages(&self) -> Vec<MessageSnapshot> {
        self.reconciliation.snapshot()
    }

    /// Revision counter bumped whenever the message list changes.
    pub fn subscribe_messages(&self) -> watch::Receiver<u64> {
        self.reconciliation.subscribe()
    }

    /// Session context.
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Connection manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Reconciliation service.
    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconciliation
    }

    /// Cross-tab sync.
    pub fn sync(&self) -> &SessionSyncBroadcaster {
        &self.sync
    }
}

/// Turn scheduler signals into refreshes, and re-arm the scheduler with
/// backoff while refreshes fail transiently.
async fn forward_refreshes(
    manager: ConnectionManager,
    scheduler: RefreshScheduler,
    mut due: mpsc::Receiver<RefreshDue>,
    mut outcomes: broadcast::Receiver<RefreshOutcome>,
    backoff: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            signal = due.recv() => {
                let Some(signal) = signal else { break };
                debug!(token_len = signal.token.len(), "refresh due");
                manager.request_refresh();
            }
            outcome = outcomes.recv() => match outcome {
                Ok(RefreshOutcome::Failed) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff.delay_for(failures, rand::random::<f64>());
                    warn!(
                        failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "credential refresh failed, retrying"
                    );
                    let _ = scheduler.retry_after(delay);
                }
                Ok(RefreshOutcome::Refreshed | RefreshOutcome::SignedOut) => failures = 0,
                Ok(RefreshOutcome::Unavailable) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
