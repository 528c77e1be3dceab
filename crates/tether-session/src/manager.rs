//! Connection manager.
//!
//! Drives the [`state`](crate::state) reducer against a real [`Transport`].
//! Every transition runs under one mutex, either from a caller entry point
//! (`connect`, `disconnect`) or from the manager's event pump, which is the
//! single consumer of transport events, timer firings and token changes.
//!
//! Credential changes are debounced through a pending-update slot: each
//! change aborts the scheduled update and schedules a new one, so a burst
//! of changes settles into one renegotiation (or reconnect).
//!
//! Every background refresh reports its [`RefreshOutcome`] back into the
//! reducer and to [`ConnectionManager::subscribe_refresh`] subscribers. A
//! reconnect never goes out without a credential once the session has had
//! one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_auth::TokenRefresher;
use tether_core::{ErrorCategory, Frame, InboundMessage, ReconnectPolicy, Rejection, frame_types};
use tether_settings::ClientSettings;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{LogoutReason, SessionContext};
use crate::reconciliation::ReconciliationService;
use crate::state::{
    ConnectionState, ConnectionStatus, Effect, Input, Machine, RefreshOutcome, transition,
};
use crate::transport::{EventSink, TaggedEvent, Transport, TransportEvent};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Connection manager settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ManagerConfig {
    /// Backend event stream URL.
    pub url: String,
    /// Reconnect bound and backoff.
    pub policy: ReconnectPolicy,
    /// Quiet period collapsing bursts of credential changes.
    pub credential_debounce: Duration,
    /// Frames buffered while connecting.
    pub queue_capacity: usize,
}

impl ManagerConfig {
    /// Config for `url` with default policy, debounce and queue size.
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = ClientSettings::default();
        Self {
            url: url.into(),
            ..Self::from_settings(&defaults)
        }
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            url: settings.server.url.clone(),
            policy: settings.reconnect.clone(),
            credential_debounce: Duration::from_millis(settings.auth.credential_debounce_ms),
            queue_capacity: settings.server.outbound_queue_capacity,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internals
// ─────────────────────────────────────────────────────────────────────────────

enum Timer {
    Reconnect { generation: u64 },
    CredentialSettled { seq: u64 },
    RefreshCompleted { outcome: RefreshOutcome },
}

/// The debounce slot. `seq` identifies the scheduled update; a firing with
/// any other `seq` was cancelled.
#[derive(Default)]
struct PendingUpdate {
    seq: u64,
    handle: Option<JoinHandle<()>>,
}

impl PendingUpdate {
    fn cancel(&mut self) {
        self.seq += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Core {
    machine: Machine,
    queue: VecDeque<String>,
    reconnect_timer: Option<JoinHandle<()>>,
    pending_update: PendingUpdate,
    /// The last socket was opened with a credential.
    had_credential: bool,
}

struct Inner {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    context: Arc<SessionContext>,
    reconciliation: ReconciliationService,
    refresher: Option<Arc<dyn TokenRefresher>>,
    core: Mutex<Core>,
    status_tx: watch::Sender<ConnectionStatus>,
    refresh_tx: broadcast::Sender<RefreshOutcome>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    refreshing: AtomicBool,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let core = self.core.get_mut();
        if let Some(timer) = core.reconnect_timer.take() {
            timer.abort();
        }
        core.pending_update.cancel();
        self.transport.disconnect();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionManager
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the transport and its state machine.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager and start its event pump. Must be called inside a
    /// tokio runtime. The manager starts `Closed`.
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        context: Arc<SessionContext>,
        reconciliation: ReconciliationService,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let machine = Machine::default();
        let (status_tx, _) = watch::channel(machine.status());
        let (refresh_tx, _) = broadcast::channel(16);
        let token_rx = context.subscribe_token();
        let cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            config,
            transport,
            context,
            reconciliation,
            refresher,
            core: Mutex::new(Core {
                machine,
                ..Core::default()
            }),
            status_tx,
            refresh_tx,
            events_tx,
            timer_tx,
            refreshing: AtomicBool::new(false),
            cancel: cancel.clone(),
        });

        let _ = tokio::spawn(pump(
            Arc::downgrade(&inner),
            events_rx,
            timer_rx,
            token_rx,
            cancel,
        ));

        Self { inner }
    }

    /// Active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Open the connection. No-op while connecting or open.
    pub fn connect(&self) {
        self.inner.apply(Input::Connect);
    }

    /// Close the connection and cancel pending reconnects and credential
    /// updates. Idempotent; always ends `Closed`.
    pub fn disconnect(&self) {
        self.inner.apply(Input::Disconnect);
    }

    /// Send a frame now. Returns `false` unless the connection is open and
    /// the transport accepted it.
    pub fn send(&self, frame: &Frame) -> bool {
        let core = self.inner.core.lock();
        if core.machine.state() != ConnectionState::Open {
            debug!(frame_type = %frame.frame_type, state = ?core.machine.state(), "send refused, not open");
            return false;
        }
        self.inner.transport.send(&frame.to_json())
    }

    /// Send a frame when open, or buffer it while connecting (including a
    /// scheduled reconnect). Returns `false` when the frame was neither
    /// sent nor buffered.
    pub fn queue(&self, frame: &Frame) -> bool {
        let mut core = self.inner.core.lock();
        let status = core.machine.status();
        match status.state {
            ConnectionState::Open => self.inner.transport.send(&frame.to_json()),
            ConnectionState::Connecting => self.inner.buffer(&mut core, frame),
            ConnectionState::Closed if status.retrying => self.inner.buffer(&mut core, frame),
            ConnectionState::Closed | ConnectionState::Closing => false,
        }
    }

    /// Current status. Never blocks on I/O.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Frames currently buffered for the next open.
    pub fn queued_len(&self) -> usize {
        self.inner.core.lock().queue.len()
    }

    /// Obtain a new credential in the background. Concurrent requests
    /// collapse into one.
    pub fn request_refresh(&self) {
        self.inner.request_refresh();
    }

    /// Watch the outcome of every background refresh.
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<RefreshOutcome> {
        self.inner.refresh_tx.subscribe()
    }

    /// Whether a refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::SeqCst)
    }

    /// Disconnect and stop the event pump.
    pub fn shutdown(&self) {
        self.disconnect();
        self.inner.cancel.cancel();
    }
}

impl Inner {
    /// Run `input` and any inputs its effects produce through the reducer.
    fn apply(self: &Arc<Self>, input: Input) {
        let mut core = self.core.lock();
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let (next, effects) = transition(&core.machine, input, &self.config.policy);
            core.machine = next;
            for effect in effects {
                self.execute(&mut core, effect, &mut inputs);
            }
        }
        let status = core.machine.status();
        drop(core);

        let _ = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn execute(self: &Arc<Self>, core: &mut Core, effect: Effect, inputs: &mut VecDeque<Input>) {
        match effect {
            Effect::OpenTransport { generation } => {
                let token = self.context.token();
                if token.is_none() && core.had_credential && core.machine.status().retrying {
                    warn!(generation, category = %ErrorCategory::Auth, "no credential for reconnect, giving up");
                    inputs.push_back(Input::CredentialMissing { generation });
                    return;
                }
                info!(url = %self.config.url, generation, "connecting");
                core.had_credential = token.is_some();
                self.transport.connect(
                    &self.config.url,
                    token.as_deref(),
                    EventSink::new(generation, self.events_tx.clone()),
                );
            }
            Effect::CloseTransport => self.transport.disconnect(),
            Effect::FinishClose => inputs.push_back(Input::CloseCompleted),
            Effect::FlushQueue => {
                let total = core.queue.len();
                while let Some(text) = core.queue.pop_front() {
                    if !self.transport.send(&text) {
                        warn!(
                            dropped = core.queue.len() + 1,
                            "transport refused queued frame, dropping remainder"
                        );
                        core.queue.clear();
                        break;
                    }
                }
                if total > 0 {
                    debug!(total, "flushed queued frames");
                }
            }
            Effect::DropQueue => {
                if !core.queue.is_empty() {
                    debug!(dropped = core.queue.len(), "dropping queued frames");
                    core.queue.clear();
                }
            }
            Effect::ScheduleReconnect {
                attempt,
                generation,
            } => {
                let delay = self.config.policy.delay_for(attempt, rand::random::<f64>());
                info!(
                    attempt,
                    max_attempts = self.config.policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reconnect scheduled"
                );
                let timer_tx = self.timer_tx.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = timer_tx.send(Timer::Reconnect { generation });
                });
                if let Some(previous) = core.reconnect_timer.replace(handle) {
                    previous.abort();
                }
            }
            Effect::CancelReconnect => {
                if let Some(timer) = core.reconnect_timer.take() {
                    timer.abort();
                }
            }
            Effect::CancelCredentialUpdate => core.pending_update.cancel(),
            Effect::Renegotiate { token } => {
                if self.transport.send(&Frame::renegotiate(&token).to_json()) {
                    info!("credential renegotiation sent");
                } else {
                    warn!("transport refused renegotiation, reconnecting");
                    inputs.push_back(Input::RenegotiationRefused);
                }
            }
            Effect::RefreshCredential => self.request_refresh(),
            Effect::SurfaceFailure { attempts } => {
                error!(
                    attempts,
                    category = %ErrorCategory::Network,
                    "reconnect attempts exhausted, connection failed"
                );
            }
        }
    }

    fn buffer(&self, core: &mut Core, frame: &Frame) -> bool {
        if core.queue.len() >= self.config.queue_capacity {
            warn!(
                capacity = self.config.queue_capacity,
                frame_type = %frame.frame_type,
                "outbound queue full"
            );
            return false;
        }
        core.queue.push_back(frame.to_json());
        true
    }

    /// Slot a credential update after the debounce window, replacing any
    /// update already scheduled.
    fn schedule_credential_update(&self) {
        let mut core = self.core.lock();
        core.pending_update.cancel();
        let seq = core.pending_update.seq;
        let timer_tx = self.timer_tx.clone();
        let delay = self.config.credential_debounce;
        core.pending_update.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(Timer::CredentialSettled { seq });
        }));
    }

    fn credential_settled(self: &Arc<Self>, seq: u64) {
        {
            let mut core = self.core.lock();
            if core.pending_update.seq != seq || core.pending_update.handle.take().is_none() {
                return;
            }
        }
        debug!("credential update settled");
        self.apply(Input::CredentialSettled {
            token: self.context.token(),
        });
    }

    /// Start a refresh unless one is in flight. The in-flight refresh
    /// reports for both requests.
    fn request_refresh(self: &Arc<Self>) {
        let Some(refresher) = self.refresher.clone() else {
            debug!("credential refresh requested but no refresher is configured");
            self.refresh_completed(RefreshOutcome::Unavailable);
            return;
        };
        if self.refreshing.swap(true, Ordering::SeqCst) {
            debug!("credential refresh already in flight");
            return;
        }

        let inner = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let outcome = match inner.context.refresh_with(refresher.as_ref()).await {
                Ok(_) => {
                    info!("credential refreshed");
                    RefreshOutcome::Refreshed
                }
                Err(err) if err.category() == ErrorCategory::Auth => {
                    warn!(error = %err, "credential refresh rejected, signing out");
                    let _ = inner.context.logout(LogoutReason::CredentialRejected).await;
                    RefreshOutcome::SignedOut
                }
                Err(err) => {
                    warn!(error = %err, category = %err.category(), "credential refresh failed");
                    RefreshOutcome::Failed
                }
            };
            inner.refreshing.store(false, Ordering::SeqCst);
            inner.refresh_completed(outcome);
        });
    }

    fn refresh_completed(&self, outcome: RefreshOutcome) {
        let _ = self.refresh_tx.send(outcome);
        let _ = self.timer_tx.send(Timer::RefreshCompleted { outcome });
    }

    fn handle_event(self: &Arc<Self>, tagged: TaggedEvent) {
        let current = self.core.lock().machine.generation();
        if tagged.generation != current {
            debug!(generation = tagged.generation, current, "ignoring stale transport event");
            return;
        }
        let generation = tagged.generation;

        match tagged.event {
            TransportEvent::Opened => {
                info!(generation, "connection open");
                self.apply(Input::Opened { generation });
            }
            TransportEvent::Message(text) => self.handle_frame(&text),
            TransportEvent::Error(message) => {
                warn!(generation, error = %message, category = %ErrorCategory::Network, "transport error");
                self.apply(Input::Errored { generation });
            }
            TransportEvent::Closed {
                code,
                reason,
                auth_rejected,
            } => {
                info!(generation, ?code, %reason, auth_rejected, "connection closed");
                self.apply(Input::Closed {
                    generation,
                    auth_rejected,
                });
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, category = %err.category(), "dropping malformed frame");
                return;
            }
        };

        match frame.frame_type.as_str() {
            frame_types::MESSAGE_CREATED => match InboundMessage::from_frame(&frame) {
                Ok(message) => {
                    let _ = self.reconciliation.process_confirmation(&message);
                }
                Err(err) => warn!(error = %err, category = %err.category(), "dropping malformed frame"),
            },
            frame_types::MESSAGE_REJECTED => match Rejection::from_frame(&frame) {
                Ok(rejection) => {
                    let _ = self.reconciliation.process_rejection(&rejection);
                }
                Err(err) => warn!(error = %err, category = %err.category(), "dropping malformed frame"),
            },
            frame_types::PING => {
                let _ = self.transport.send(&Frame::pong().to_json());
            }
            frame_types::AUTH_EXPIRED => {
                info!("server reported credential expired");
                self.request_refresh();
            }
            frame_types::AUTH_ACCEPTED => debug!("credential renegotiation accepted"),
            frame_types::CONNECTION_ESTABLISHED => {
                debug!(client_id = frame.payload_str("clientId"), "connection established");
            }
            other => debug!(frame_type = other, "ignoring unknown frame type"),
        }
    }
}

async fn pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TaggedEvent>,
    mut timers: mpsc::UnboundedReceiver<Timer>,
    mut tokens: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
) {
    let mut watching_tokens = true;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(event) = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_event(event);
            }
            Some(timer) = timers.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match timer {
                    Timer::Reconnect { generation } => inner.apply(Input::ReconnectDue { generation }),
                    Timer::CredentialSettled { seq } => inner.credential_settled(seq),
                    Timer::RefreshCompleted { outcome } => {
                        inner.apply(Input::RefreshCompleted { outcome });
                    }
                }
            }
            changed = tokens.changed(), if watching_tokens => {
                if changed.is_err() {
                    watching_tokens = false;
                    continue;
                }
                let Some(inner) = inner.upgrade() else { break };
                inner.schedule_credential_update();
            }
        }
    }
    debug!("connection event pump stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
