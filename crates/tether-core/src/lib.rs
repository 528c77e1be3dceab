//! # tether-core
//!
//! Foundation types shared by every tether crate.
//!
//! - **Branded IDs**: [`LocalMessageId`], [`ServerMessageId`], [`TabId`] as newtypes
//! - **Wire frames**: [`Frame`] with the `type` + `payload` contract
//! - **Messages**: [`OptimisticMessage`], [`MessageStatus`], [`InboundMessage`]
//! - **Errors**: [`FrameError`] and the [`ErrorCategory`] classification
//! - **Backoff**: [`ReconnectPolicy`] for bounded exponential reconnects
//! - **Logging**: `tracing` subscriber setup and test capture helpers

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod ids;
pub mod logging;
pub mod message;
pub mod retry;

pub use errors::{ErrorCategory, FrameError};
pub use frame::{Frame, frame_types};
pub use ids::{LocalMessageId, ServerMessageId, TabId};
pub use message::{
    InboundMessage, MessageDraft, MessageRole, MessageSnapshot, MessageStatus, OptimisticMessage,
    Rejection,
};
pub use retry::ReconnectPolicy;
