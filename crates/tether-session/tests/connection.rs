//! Connection manager behaviour against a scripted transport.

#![allow(missing_docs, unused_results)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tether_auth::MemoryCredentialStore;
use tether_core::logging::capture_logs;
use tether_core::{ErrorCategory, Frame, LocalMessageId, MessageDraft, ReconnectPolicy, frame_types};
use tether_session::testing::{MockTransport, ScriptedRefresher};
use tether_session::{ConnectionState, LogoutReason, ManagerConfig};
use tracing::Level;

use common::{context_with, harness, harness_with, settle, wait_status, wait_until};

#[tokio::test(start_paused = true)]
async fn connect_twice_performs_one_handshake() {
    let mut h = harness(MockTransport::auto_open());
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.manager.connect();
    settle().await;
    assert_eq!(h.transport.connect_count(), 1);
    assert!(h.manager.status().is_open());
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_is_noop() {
    let h = harness(MockTransport::new());
    h.manager.connect();
    h.manager.connect();
    assert_eq!(h.transport.connect_count(), 1);
    assert_eq!(h.manager.status().state, ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn disconnect_from_any_state_ends_closed() {
    let mut h = harness(MockTransport::new());

    // Closed
    h.manager.disconnect();
    assert_eq!(h.manager.status().state, ConnectionState::Closed);

    // Connecting
    h.manager.connect();
    h.manager.disconnect();
    assert_eq!(h.manager.status().state, ConnectionState::Closed);

    // Open
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;
    h.manager.disconnect();
    assert_eq!(h.manager.status().state, ConnectionState::Closed);

    // Waiting to reconnect
    h.manager.connect();
    h.transport.emit_close(None, false);
    wait_status(&mut h.status, |s| s.retrying).await;
    let connects = h.transport.connect_count();
    h.manager.disconnect();
    let status = h.manager.status();
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(!status.retrying);

    // The cancelled reconnect never fires.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.connect_count(), connects);
    assert_eq!(h.manager.status().state, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_reconnects_with_backoff() {
    let mut h = harness(MockTransport::new());
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_close(Some(1006), false);
    let status = wait_status(&mut h.status, |s| s.retrying).await;
    assert_eq!(status.attempt, 1);
    assert_eq!(status.last_error, Some(ErrorCategory::Network));

    // Backoff for attempt 1 is at most base + 20% jitter.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(h.transport.connect_count(), 1);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.transport.connect_count(), 2);

    h.transport.emit_open();
    let status = wait_status(&mut h.status, |s| s.is_open()).await;
    assert_eq!(status.attempt, 0);
    assert!(!status.retrying);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_surface_failure() {
    let (logs, _guard) = capture_logs();
    let config = ManagerConfig {
        policy: ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        },
        ..ManagerConfig::new("ws://test/ws")
    };
    let mut h = harness_with(
        config,
        MockTransport::new(),
        context_with(Arc::new(MemoryCredentialStore::new())),
        None,
    );

    h.manager.connect();
    for expected in 2..=3 {
        h.transport.emit_close(None, false);
        let transport = h.transport.clone();
        wait_until(move || transport.connect_count() == expected).await;
    }
    h.transport.emit_close(None, false);

    let status = wait_status(&mut h.status, |s| s.failed).await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(!status.retrying);
    assert_eq!(status.last_error, Some(ErrorCategory::Network));
    assert!(logs.has_event(Level::ERROR, "reconnect attempts exhausted"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.transport.connect_count(), 3);

    // A fresh connect starts over.
    h.manager.connect();
    assert_eq!(h.transport.connect_count(), 4);
    assert!(!h.manager.status().failed);
}

#[tokio::test(start_paused = true)]
async fn send_returns_false_unless_open() {
    let mut h = harness(MockTransport::new());
    assert!(!h.manager.send(&Frame::pong()));

    h.manager.connect();
    assert!(!h.manager.send(&Frame::pong()));

    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;
    assert!(h.manager.send(&Frame::pong()));

    h.manager.disconnect();
    assert!(!h.manager.send(&Frame::pong()));
    assert_eq!(h.transport.sent_frames_of_type(frame_types::PONG).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_queued_while_connecting_flush_on_open() {
    let mut h = harness(MockTransport::new());
    h.manager.connect();

    let id = LocalMessageId::from("l1");
    assert!(h.manager.queue(&Frame::message_send(&id, "first", tether_core::MessageRole::User)));
    assert!(h.manager.queue(&Frame::pong()));
    assert!(h.transport.sent().is_empty());

    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;
    settle().await;

    let sent = h.transport.sent_frames();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].frame_type, frame_types::MESSAGE_SEND);
    assert_eq!(sent[0].payload_str("localId"), Some("l1"));
    assert_eq!(sent[1].frame_type, frame_types::PONG);
    assert_eq!(h.manager.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_logged_and_connection_stays_open() {
    let (logs, _guard) = capture_logs();
    let mut h = harness(MockTransport::auto_open());
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_message("not json");
    h.transport.emit_message(r#"{"payload":{}}"#);
    h.transport.emit_message(r#"{"type":"ping"}"#);
    h.transport.emit_frame(&Frame::new(frame_types::PING, json!({})));
    settle().await;

    assert!(h.manager.status().is_open());
    assert_eq!(logs.count_matching(Level::WARN, "dropping malformed frame"), 3);
    assert_eq!(h.transport.sent_frames_of_type(frame_types::PONG).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn inbound_confirmation_reaches_reconciliation() {
    let mut h = harness(MockTransport::auto_open());
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    let message = h.reconciliation.add_optimistic_message(MessageDraft::user("hello"));
    h.transport.emit_frame(&Frame::new(
        frame_types::MESSAGE_CREATED,
        json!({
            "id": "srv_1",
            "content": "hello",
            "role": "user",
            "correlationId": message.local_id,
        }),
    ));
    settle().await;

    assert_eq!(h.reconciliation.pending_count(), 0);
    assert_eq!(h.reconciliation.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn credential_burst_collapses_into_one_renegotiation() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("t0", None).unwrap();
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::auto_open(),
        context,
        None,
    );
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;
    assert_eq!(h.transport.last_token().as_deref(), Some("t0"));

    for token in ["t1", "t2", "t3"] {
        h.context.update_token(token).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let renegotiations = h.transport.sent_frames_of_type(frame_types::AUTH_RENEGOTIATE);
    assert_eq!(renegotiations.len(), 1);
    assert_eq!(renegotiations[0].payload_str("token"), Some("t3"));
    assert_eq!(h.transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cleared_then_restored_credential_is_one_operation() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("old", None).unwrap();
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::auto_open(),
        context,
        None,
    );
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    let _ = h.context.logout(LogoutReason::UserInitiated).await;
    h.context.login("fresh", None).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(h.manager.status().is_open());
    let renegotiations = h.transport.sent_frames_of_type(frame_types::AUTH_RENEGOTIATE);
    assert_eq!(renegotiations.len(), 1);
    assert_eq!(renegotiations[0].payload_str("token"), Some("fresh"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_credential_update() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("t0", None).unwrap();
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::auto_open(),
        context,
        None,
    );
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.context.update_token("t1").unwrap();
    settle().await;
    h.manager.disconnect();
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(h.transport.sent_frames_of_type(frame_types::AUTH_RENEGOTIATE).is_empty());
    assert_eq!(h.transport.last_token().as_deref(), Some("t1"));
}

#[tokio::test(start_paused = true)]
async fn refused_renegotiation_reconnects_with_new_token() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("t0", None).unwrap();
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::auto_open(),
        context,
        None,
    );
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.set_accept_sends(false);
    h.context.update_token("t1").unwrap();
    let transport = h.transport.clone();
    wait_until(move || transport.connect_count() == 2).await;

    assert_eq!(h.transport.last_token().as_deref(), Some("t1"));
    wait_status(&mut h.status, |s| s.is_open()).await;
}

#[tokio::test(start_paused = true)]
async fn auth_rejected_close_refreshes_before_reconnect() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("old", Some("refresh")).unwrap();
    let refresher = Arc::new(ScriptedRefresher::issuing("new"));
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::new(),
        context,
        Some(refresher.clone()),
    );
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_close(Some(4401), true);
    let status = wait_status(&mut h.status, |s| s.retrying).await;
    assert_eq!(status.last_error, Some(ErrorCategory::Auth));

    let transport = h.transport.clone();
    wait_until(move || transport.connect_count() == 2).await;
    assert_eq!(refresher.calls(), 1);
    assert_eq!(h.transport.last_token().as_deref(), Some("new-1"));
}

#[tokio::test(start_paused = true)]
async fn expired_frame_refreshes_and_renegotiates() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("old", Some("refresh")).unwrap();
    let refresher = Arc::new(ScriptedRefresher::issuing("new"));
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::auto_open(),
        context,
        Some(refresher.clone()),
    );
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport
        .emit_frame(&Frame::new(frame_types::AUTH_EXPIRED, json!({})));
    h.transport
        .emit_frame(&Frame::new(frame_types::AUTH_EXPIRED, json!({})));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(refresher.calls(), 1);
    let renegotiations = h.transport.sent_frames_of_type(frame_types::AUTH_RENEGOTIATE);
    assert_eq!(renegotiations.len(), 1);
    assert_eq!(renegotiations[0].payload_str("token"), Some("new-1"));
    assert!(!h.manager.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn rejected_refresh_signs_out_and_closes() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("old", Some("refresh")).unwrap();
    let mut events = context.subscribe_events();
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::auto_open(),
        context,
        Some(Arc::new(ScriptedRefresher::rejecting(401))),
    );
    h.manager.connect();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport
        .emit_frame(&Frame::new(frame_types::AUTH_EXPIRED, json!({})));
    let status = wait_status(&mut h.status, |s| s.state == ConnectionState::Closed).await;
    assert!(!status.retrying);
    assert!(!h.context.is_authenticated());
    assert_matches!(
        events.recv().await,
        Ok(tether_session::SessionEvent::SignedOut(LogoutReason::CredentialRejected))
    );
}

#[tokio::test(start_paused = true)]
async fn logout_while_retrying_cancels_reconnect() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("t0", None).unwrap();
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::new(),
        context,
        None,
    );
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_close(None, false);
    wait_status(&mut h.status, |s| s.retrying).await;
    let _ = h.context.logout(LogoutReason::UserInitiated).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.connect_count(), 1);
    let status = h.manager.status();
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(!status.retrying);
    assert_eq!(status.attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_due_right_after_logout_does_not_connect_anonymously() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("t0", None).unwrap();
    let config = ManagerConfig {
        // Longer than any backoff, so the reconnect fires before the
        // cleared credential settles.
        credential_debounce: Duration::from_secs(5),
        ..ManagerConfig::new("ws://test/ws")
    };
    let mut h = harness_with(config, MockTransport::new(), context, None);
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_close(None, false);
    wait_status(&mut h.status, |s| s.retrying).await;
    let _ = h.context.logout(LogoutReason::UserInitiated).await;

    let status = wait_status(&mut h.status, |s| !s.retrying).await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(status.last_error, Some(ErrorCategory::Auth));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn anonymous_connection_still_reconnects() {
    let mut h = harness(MockTransport::new());
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_close(None, false);
    let transport = h.transport.clone();
    wait_until(move || transport.connect_count() == 2).await;
    assert_eq!(h.transport.last_token(), None);
}

#[tokio::test(start_paused = true)]
async fn slow_refresh_holds_reconnect_until_new_credential() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("old", Some("refresh")).unwrap();
    let refresher = Arc::new(ScriptedRefresher::issuing("new").with_latency(Duration::from_secs(10)));
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::new(),
        context,
        Some(refresher.clone()),
    );
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_close(Some(4401), true);
    wait_status(&mut h.status, |s| s.retrying).await;

    // Well past the first backoff, still waiting on the refresh.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.connect_count(), 1);
    assert!(h.manager.status().retrying);
    assert!(h.manager.is_refreshing());

    let transport = h.transport.clone();
    wait_until(move || transport.connect_count() == 2).await;
    assert_eq!(h.transport.last_token().as_deref(), Some("new-1"));
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn auth_rejected_close_without_refresher_still_retries() {
    let context = context_with(Arc::new(MemoryCredentialStore::new()));
    context.login("old", None).unwrap();
    let mut h = harness_with(
        ManagerConfig::new("ws://test/ws"),
        MockTransport::new(),
        context,
        None,
    );
    h.manager.connect();
    h.transport.emit_open();
    wait_status(&mut h.status, |s| s.is_open()).await;

    h.transport.emit_close(Some(4401), true);
    let transport = h.transport.clone();
    wait_until(move || transport.connect_count() == 2).await;
    assert_eq!(h.transport.last_token().as_deref(), Some("old"));
}
