//! Shared helpers for the session integration tests.

#![allow(dead_code, missing_docs, unused_results)]

use std::sync::Arc;
use std::time::Duration;

use tether_auth::{CredentialStore, MemoryCredentialStore, TokenRefresher};
use tether_core::TabId;
use tether_session::testing::MockTransport;
use tether_session::{
    ConnectionManager, ConnectionStatus, ManagerConfig, ReconciliationService, SessionContext,
};
use tokio::sync::watch;

/// Virtual-time budget for a condition to become true.
const WAIT_LIMIT: Duration = Duration::from_secs(120);
const POLL: Duration = Duration::from_millis(50);

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub context: Arc<SessionContext>,
    pub reconciliation: ReconciliationService,
    pub manager: ConnectionManager,
    pub status: watch::Receiver<ConnectionStatus>,
}

pub fn context_with(store: Arc<dyn CredentialStore>) -> Arc<SessionContext> {
    Arc::new(SessionContext::new(TabId::from("tab-a"), store))
}

pub fn harness(transport: MockTransport) -> Harness {
    harness_with(
        ManagerConfig::new("ws://test/ws"),
        transport,
        context_with(Arc::new(MemoryCredentialStore::new())),
        None,
    )
}

pub fn harness_with(
    config: ManagerConfig,
    transport: MockTransport,
    context: Arc<SessionContext>,
    refresher: Option<Arc<dyn TokenRefresher>>,
) -> Harness {
    let transport = Arc::new(transport);
    let reconciliation = ReconciliationService::default();
    let manager = ConnectionManager::new(
        config,
        transport.clone(),
        context.clone(),
        reconciliation.clone(),
        refresher,
    );
    let status = manager.subscribe_status();
    Harness {
        transport,
        context,
        reconciliation,
        manager,
        status,
    }
}

/// Wait (in virtual time) until the published status satisfies `f`.
pub async fn wait_status(
    status: &mut watch::Receiver<ConnectionStatus>,
    f: impl FnMut(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    tokio::time::timeout(WAIT_LIMIT, status.wait_for(f))
        .await
        .expect("status condition not reached")
        .expect("status sender dropped")
        .clone()
}

/// Poll `f` until it holds.
pub async fn wait_until(mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(POLL).await;
    }
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
