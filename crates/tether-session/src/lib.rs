//! # tether-session
//!
//! Realtime chat session layer for one client context ("tab").
//!
//! - [`ConnectionManager`]: transport ownership, a pure state machine
//!   ([`state::transition`]), bounded backoff reconnects and debounced
//!   credential renegotiation
//! - [`ReconciliationService`]: optimistic messages resolved by server echo,
//!   rejection or timeout
//! - [`SessionSyncBroadcaster`]: logout mirrored across tabs through
//!   [`SharedStorage`] events
//! - [`SessionContext`]: the injected authentication state everything shares
//! - [`ChatSession`]: the facade wiring them together
//!
//! ## Example
//!
//! ```ignore
//! let shared = SharedStorage::new();
//! let storage = shared.tab(TabId::new());
//! let store = Arc::new(StorageCredentialStore::new(storage.clone(), "auth_token", "refresh_token"));
//! let context = Arc::new(SessionContext::new(storage.tab_id().clone(), store));
//! let session = ChatSession::new(&settings, context, storage, Arc::new(WebSocketTransport::default()), None);
//! session.start();
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod context;
pub mod errors;
pub mod manager;
pub mod reconciliation;
pub mod state;
pub mod storage;
pub mod sync;
pub mod testing;
pub mod transport;

pub use client::ChatSession;
pub use context::{BackendLogout, LogoutReason, LogoutReport, SessionContext, SessionEvent};
pub use errors::{SessionError, TransportError};
pub use manager::{ConnectionManager, ManagerConfig};
pub use reconciliation::{ReconciliationConfig, ReconciliationService};
pub use state::{ConnectionState, ConnectionStatus, RefreshOutcome};
pub use storage::{SharedStorage, StorageCredentialStore, StorageEvent, TabStorage};
pub use sync::SessionSyncBroadcaster;
pub use transport::{EventSink, TaggedEvent, Transport, TransportEvent, WebSocketTransport};
