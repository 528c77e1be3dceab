//! Conversation message types.
//!
//! [`OptimisticMessage`] is what the client shows before the server has
//! confirmed anything. [`InboundMessage`] and [`Rejection`] are the typed
//! forms of the `message.created` and `message.rejected` frames that
//! resolve it. The UI only ever sees [`MessageSnapshot`] copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::frame::{Frame, frame_types};
use crate::ids::{LocalMessageId, ServerMessageId};

/// Author role of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Written by the local user.
    User,
    /// Produced by the assistant / other party.
    Assistant,
    /// System notice.
    System,
}

impl MessageRole {
    /// Parse the wire form (`"user"`, `"assistant"`, `"system"`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Lifecycle state of a displayed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created locally, waiting for the server.
    Pending,
    /// Acknowledged by the server (or received from it).
    Confirmed,
    /// Not confirmed in time, or could not be sent.
    Failed,
    /// Explicitly rejected by the server.
    Superseded,
}

impl MessageStatus {
    /// Whether the message has left the pending state.
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Input to `add_optimistic_message`.
#[derive(Clone, Debug)]
pub struct MessageDraft {
    /// Caller-provided id; one is assigned when absent.
    pub local_id: Option<LocalMessageId>,
    /// Message body.
    pub content: String,
    /// Author role.
    pub role: MessageRole,
}

impl MessageDraft {
    /// Draft of a user-authored message with no preassigned id.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            local_id: None,
            content: content.into(),
            role: MessageRole::User,
        }
    }

    /// Use a specific local id.
    #[must_use]
    pub fn with_local_id(mut self, id: LocalMessageId) -> Self {
        self.local_id = Some(id);
        self
    }
}

/// A message applied to local state before server confirmation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticMessage {
    /// Client-assigned id.
    pub local_id: LocalMessageId,
    /// Message body.
    pub content: String,
    /// Author role.
    pub role: MessageRole,
    /// When the client created it.
    pub created_at: DateTime<Utc>,
    /// Server id, set once confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_confirmation_id: Option<ServerMessageId>,
}

/// Immutable view of one displayed message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshot {
    /// Local id; `None` for messages that originated elsewhere.
    pub local_id: Option<LocalMessageId>,
    /// Server id once known.
    pub server_id: Option<ServerMessageId>,
    /// Message body.
    pub content: String,
    /// Author role.
    pub role: MessageRole,
    /// Current lifecycle state.
    pub status: MessageStatus,
    /// Local creation time (display order follows this).
    pub created_at: DateTime<Utc>,
    /// Server-reported delivery time, metadata only.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Why the message failed or was superseded.
    pub error: Option<String>,
}

/// Typed `message.created` payload.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    /// Server id (`id`).
    pub server_id: ServerMessageId,
    /// Message body (`content`).
    pub content: String,
    /// Author role (`role`).
    pub role: MessageRole,
    /// Echo of the sender's `localId` (`correlationId`), when present.
    pub correlation_id: Option<LocalMessageId>,
    /// Server timestamp (`timestamp`, RFC 3339), when present.
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    /// Decode a `message.created` frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let invalid = |reason: &str| FrameError::InvalidPayload {
            frame_type: frame.frame_type.clone(),
            reason: reason.to_string(),
        };
        if frame.frame_type != frame_types::MESSAGE_CREATED {
            return Err(invalid("not a message.created frame"));
        }

        let server_id = frame
            .payload_str("id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing `id`"))?;
        let content = frame
            .payload_str("content")
            .ok_or_else(|| invalid("missing `content`"))?;
        let role = frame
            .payload_str("role")
            .and_then(MessageRole::parse)
            .ok_or_else(|| invalid("missing or unknown `role`"))?;
        let correlation_id = frame
            .payload_str("correlationId")
            .filter(|s| !s.is_empty())
            .map(LocalMessageId::from);
        let timestamp = frame
            .payload_str("timestamp")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(Self {
            server_id: ServerMessageId::from(server_id),
            content: content.to_string(),
            role,
            correlation_id,
            timestamp,
        })
    }

    /// Content + role fingerprint comparison against an optimistic message.
    pub fn fingerprint_matches(&self, message: &OptimisticMessage) -> bool {
        self.role == message.role && self.content.trim() == message.content.trim()
    }
}

/// Typed `message.rejected` payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    /// The `localId` of the refused message.
    pub correlation_id: LocalMessageId,
    /// Server-provided reason.
    pub reason: Option<String>,
}

impl Rejection {
    /// Decode a `message.rejected` frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let correlation_id = frame
            .payload_str("correlationId")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FrameError::InvalidPayload {
                frame_type: frame.frame_type.clone(),
                reason: "missing `correlationId`".to_string(),
            })?;
        Ok(Self {
            correlation_id: LocalMessageId::from(correlation_id),
            reason: frame.payload_str("reason").map(str::to_string),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn created(payload: serde_json::Value) -> Frame {
        Frame::new(frame_types::MESSAGE_CREATED, payload)
    }

    #[test]
    fn role_parse() {
        assert_eq!(MessageRole::parse("user"), Some(MessageRole::User));
        assert_eq!(MessageRole::parse("assistant"), Some(MessageRole::Assistant));
        assert_eq!(MessageRole::parse("robot"), None);
    }

    #[test]
    fn status_resolution() {
        assert!(!MessageStatus::Pending.is_resolved());
        assert!(MessageStatus::Confirmed.is_resolved());
        assert!(MessageStatus::Failed.is_resolved());
        assert!(MessageStatus::Superseded.is_resolved());
    }

    #[test]
    fn inbound_full_payload() {
        let frame = created(json!({
            "id": "srv_1",
            "content": "hello",
            "role": "user",
            "correlationId": "loc_1",
            "timestamp": "2026-01-02T03:04:05Z",
        }));
        let msg = InboundMessage::from_frame(&frame).unwrap();
        assert_eq!(msg.server_id.as_str(), "srv_1");
        assert_eq!(msg.correlation_id.as_ref().map(LocalMessageId::as_str), Some("loc_1"));
        assert!(msg.timestamp.is_some());
    }

    #[test]
    fn inbound_without_correlation() {
        let frame = created(json!({"id": "srv_2", "content": "yo", "role": "assistant"}));
        let msg = InboundMessage::from_frame(&frame).unwrap();
        assert!(msg.correlation_id.is_none());
        assert!(msg.timestamp.is_none());
    }

    #[test]
    fn inbound_missing_id_is_invalid() {
        let frame = created(json!({"content": "yo", "role": "user"}));
        assert_matches!(
            InboundMessage::from_frame(&frame),
            Err(FrameError::InvalidPayload { .. })
        );
    }

    #[test]
    fn fingerprint_ignores_surrounding_whitespace() {
        let local = OptimisticMessage {
            local_id: LocalMessageId::from("l"),
            content: "hello ".into(),
            role: MessageRole::User,
            created_at: Utc::now(),
            server_confirmation_id: None,
        };
        let frame = created(json!({"id": "s", "content": "hello", "role": "user"}));
        let inbound = InboundMessage::from_frame(&frame).unwrap();
        assert!(inbound.fingerprint_matches(&local));

        let frame = created(json!({"id": "s", "content": "hello", "role": "assistant"}));
        let inbound = InboundMessage::from_frame(&frame).unwrap();
        assert!(!inbound.fingerprint_matches(&local));
    }

    #[test]
    fn rejection_requires_correlation() {
        let frame = Frame::new(frame_types::MESSAGE_REJECTED, json!({"reason": "spam"}));
        assert!(Rejection::from_frame(&frame).is_err());

        let frame = Frame::new(
            frame_types::MESSAGE_REJECTED,
            json!({"correlationId": "loc_3", "reason": "spam"}),
        );
        let rej = Rejection::from_frame(&frame).unwrap();
        assert_eq!(rej.correlation_id.as_str(), "loc_3");
        assert_eq!(rej.reason.as_deref(), Some("spam"));
    }
}
