//! Test doubles for the session's collaborators.
//!
//! [`MockTransport`] records what the manager asked of it and lets a test
//! play the server's side by pushing events into the current sink.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tether_auth::{
    AuthError, CredentialStore, LogoutBackend, RefreshedTokens, TokenRefresher,
    encode_unsigned_token, now_secs,
};
use tether_core::Frame;

use crate::transport::{EventSink, Transport, TransportEvent};

// ─────────────────────────────────────────────────────────────────────────────
// MockTransport
// ─────────────────────────────────────────────────────────────────────────────

/// One `connect` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectCall {
    /// Requested URL.
    pub url: String,
    /// Credential presented.
    pub token: Option<String>,
    /// Generation stamped on the sink.
    pub generation: u64,
}

struct MockState {
    connects: Vec<ConnectCall>,
    sink: Option<EventSink>,
    sent: Vec<String>,
    accept_sends: bool,
    auto_open: bool,
    disconnects: usize,
}

/// In-memory [`Transport`].
///
/// Sends are accepted while a sink is attached (between `connect` and
/// `disconnect`) unless [`set_accept_sends(false)`](Self::set_accept_sends).
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport that waits for the test to emit events.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                connects: Vec::new(),
                sink: None,
                sent: Vec::new(),
                accept_sends: true,
                auto_open: false,
                disconnects: 0,
            }),
        }
    }

    /// Transport that reports `Opened` as soon as `connect` is called.
    pub fn auto_open() -> Self {
        let transport = Self::new();
        transport.set_auto_open(true);
        transport
    }

    /// Toggle immediate `Opened` on connect.
    pub fn set_auto_open(&self, auto_open: bool) {
        self.state.lock().auto_open = auto_open;
    }

    /// Toggle whether `send` succeeds.
    pub fn set_accept_sends(&self, accept: bool) {
        self.state.lock().accept_sends = accept;
    }

    /// Every `connect` call so far.
    pub fn connects(&self) -> Vec<ConnectCall> {
        self.state.lock().connects.clone()
    }

    /// Number of `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects.len()
    }

    /// Credential presented by the latest `connect`.
    pub fn last_token(&self) -> Option<String> {
        self.state.lock().connects.last().and_then(|c| c.token.clone())
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    /// Raw text of every accepted send.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Every accepted send, parsed.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent()
            .iter()
            .filter_map(|text| Frame::parse(text).ok())
            .collect()
    }

    /// Accepted sends of one frame type.
    pub fn sent_frames_of_type(&self, frame_type: &str) -> Vec<Frame> {
        self.sent_frames()
            .into_iter()
            .filter(|f| f.frame_type == frame_type)
            .collect()
    }

    /// Push an event into the current sink. `false` if nothing is connected.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.state.lock().sink.clone();
        sink.is_some_and(|sink| sink.emit(event))
    }

    /// Report the handshake as complete.
    pub fn emit_open(&self) -> bool {
        self.emit(TransportEvent::Opened)
    }

    /// Deliver inbound text.
    pub fn emit_message(&self, text: &str) -> bool {
        self.emit(TransportEvent::Message(text.to_string()))
    }

    /// Deliver an inbound frame.
    pub fn emit_frame(&self, frame: &Frame) -> bool {
        self.emit_message(&frame.to_json())
    }

    /// Report a transport error.
    pub fn emit_error(&self, message: &str) -> bool {
        self.emit(TransportEvent::Error(message.to_string()))
    }

    /// Close the socket from the server side and detach the sink.
    pub fn emit_close(&self, code: Option<u16>, auth_rejected: bool) -> bool {
        let sink = self.state.lock().sink.take();
        sink.is_some_and(|sink| {
            sink.emit(TransportEvent::Closed {
                code,
                reason: "closed by test".into(),
                auth_rejected,
            })
        })
    }
}

impl Transport for MockTransport {
    fn connect(&self, url: &str, token: Option<&str>, sink: EventSink) {
        let mut state = self.state.lock();
        state.connects.push(ConnectCall {
            url: url.to_string(),
            token: token.map(str::to_string),
            generation: sink.generation(),
        });
        if state.auto_open {
            let _ = sink.emit(TransportEvent::Opened);
        }
        state.sink = Some(sink);
    }

    fn send(&self, text: &str) -> bool {
        let mut state = self.state.lock();
        if !state.accept_sends || state.sink.is_none() {
            return false;
        }
        state.sent.push(text.to_string());
        true
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.sink = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// [`LogoutBackend`] that records the tokens it was called with.
#[derive(Default)]
pub struct RecordingLogoutBackend {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingLogoutBackend {
    /// Backend that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that always fails with a 503.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Tokens passed to `logout`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LogoutBackend for RecordingLogoutBackend {
    async fn logout(&self, token: &str) -> Result<(), AuthError> {
        self.calls.lock().push(token.to_string());
        if self.fail {
            return Err(AuthError::Logout {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(())
    }
}

/// Unsigned JWT-shaped token for `subject`, valid for `lifetime_secs` from now.
pub fn token_for(subject: &str, lifetime_secs: i64) -> String {
    let now = now_secs();
    encode_unsigned_token(&json!({
        "sub": subject,
        "iat": now,
        "exp": now + lifetime_secs,
    }))
}

/// [`TokenRefresher`] issuing `<prefix>-<n>` tokens, or refusing with a
/// fixed status.
///
/// Tokens are opaque unless [`with_lifetime`](Self::with_lifetime) is set,
/// in which case they are JWT-shaped with `<prefix>-<n>` as the subject.
/// The `n` counts successful refreshes only.
pub struct ScriptedRefresher {
    prefix: String,
    lifetime_secs: Option<i64>,
    reject_status: Option<u16>,
    latency: Option<Duration>,
    transient_failures: AtomicUsize,
    calls: AtomicUsize,
    issued: AtomicUsize,
}

impl ScriptedRefresher {
    /// Refresher that succeeds.
    pub fn issuing(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            lifetime_secs: None,
            reject_status: None,
            latency: None,
            transient_failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
        }
    }

    /// Issue decodable tokens valid for `lifetime_secs`.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime_secs: i64) -> Self {
        self.lifetime_secs = Some(lifetime_secs);
        self
    }

    /// Take `latency` to answer each call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the first `count` calls with a 503 before succeeding.
    #[must_use]
    pub fn failing_first(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Refresher that fails with HTTP `status`.
    pub fn rejecting(status: u16) -> Self {
        Self {
            reject_status: Some(status),
            ..Self::issuing("")
        }
    }

    /// Number of refresh calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for ScriptedRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(status) = self.reject_status {
            return Err(AuthError::Refresh {
                status,
                message: "refused".into(),
            });
        }
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if transient {
            return Err(AuthError::Refresh {
                status: 503,
                message: "unavailable".into(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let subject = format!("{}-{n}", self.prefix);
        let access_token = match self.lifetime_secs {
            Some(lifetime) => token_for(&subject, lifetime),
            None => subject,
        };
        Ok(RefreshedTokens {
            access_token,
            refresh_token: None,
        })
    }
}

/// [`CredentialStore`] whose reads work but whose removal always fails.
pub struct FailingCredentialStore {
    token: Mutex<Option<String>>,
}

impl FailingCredentialStore {
    /// Store holding `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }
}

impl CredentialStore for FailingCredentialStore {
    fn get_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.token.lock().clone())
    }

    fn set_token(&self, token: &str) -> Result<(), AuthError> {
        *self.token.lock() = Some(token.to_string());
        Ok(())
    }

    fn remove_token(&self) -> Result<(), AuthError> {
        Err(AuthError::Storage("storage is read-only".into()))
    }

    fn get_refresh_token(&self) -> Result<Option<String>, AuthError> {
        Ok(None)
    }

    fn set_refresh_token(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}
