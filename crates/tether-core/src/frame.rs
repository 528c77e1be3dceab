//! Wire frames.
//!
//! Every frame exchanged with the backend is a JSON object with a `type`
//! discriminator string and a `payload` object:
//!
//! ```json
//! { "type": "message.created", "payload": { "id": "srv_1", "content": "hi", "role": "user" } }
//! ```
//!
//! A frame missing either field is a [`FrameError`] (parse category), which
//! the connection layer logs and drops without closing the socket.

use serde_json::{Map, Value, json};

use crate::errors::FrameError;
use crate::ids::LocalMessageId;
use crate::message::MessageRole;

/// Known frame type discriminators.
pub mod frame_types {
    /// Outbound: a user-authored message (`{localId, content, role}`).
    pub const MESSAGE_SEND: &str = "message.send";
    /// Inbound: a message persisted by the server.
    pub const MESSAGE_CREATED: &str = "message.created";
    /// Inbound: the server refused a message the client sent.
    pub const MESSAGE_REJECTED: &str = "message.rejected";
    /// Outbound: swap the credential on an open connection.
    pub const AUTH_RENEGOTIATE: &str = "auth.renegotiate";
    /// Inbound: renegotiation succeeded.
    pub const AUTH_ACCEPTED: &str = "auth.accepted";
    /// Inbound: the server considers the current credential expired.
    pub const AUTH_EXPIRED: &str = "auth.expired";
    /// Inbound: greeting sent by the server after the handshake.
    pub const CONNECTION_ESTABLISHED: &str = "connection.established";
    /// Server liveness check.
    pub const PING: &str = "ping";
    /// Liveness reply.
    pub const PONG: &str = "pong";
}

/// A validated wire frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// The `type` discriminator.
    pub frame_type: String,
    /// The `payload` object.
    pub payload: Map<String, Value>,
}

impl Frame {
    /// Build a frame from a type and a JSON payload.
    ///
    /// Non-object payloads are replaced with an empty object so the frame
    /// always satisfies the wire contract.
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            frame_type: frame_type.into(),
            payload,
        }
    }

    /// Parse and validate an inbound frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(FrameError::NotAnObject);
        };

        let frame_type = match obj.remove("type") {
            Some(Value::String(t)) if !t.is_empty() => t,
            _ => return Err(FrameError::MissingType),
        };

        let Some(Value::Object(payload)) = obj.remove("payload") else {
            return Err(FrameError::MissingPayload { frame_type });
        };

        Ok(Self {
            frame_type,
            payload,
        })
    }

    /// Serialize the frame to its wire form.
    pub fn to_json(&self) -> String {
        json!({
            "type": self.frame_type,
            "payload": self.payload,
        })
        .to_string()
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// `message.send` frame for an optimistic message.
    pub fn message_send(local_id: &LocalMessageId, content: &str, role: MessageRole) -> Self {
        Self::new(
            frame_types::MESSAGE_SEND,
            json!({
                "localId": local_id,
                "content": content,
                "role": role,
            }),
        )
    }

    /// `auth.renegotiate` frame carrying a replacement token.
    pub fn renegotiate(token: &str) -> Self {
        Self::new(frame_types::AUTH_RENEGOTIATE, json!({ "token": token }))
    }

    /// `pong` reply.
    pub fn pong() -> Self {
        Self::new(frame_types::PONG, json!({}))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_valid_frame() {
        let frame = Frame::parse(r#"{"type":"ping","payload":{}}"#).unwrap();
        assert_eq!(frame.frame_type, "ping");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn parse_keeps_payload_fields() {
        let frame =
            Frame::parse(r#"{"type":"message.created","payload":{"id":"s1","content":"hi"}}"#)
                .unwrap();
        assert_eq!(frame.payload_str("id"), Some("s1"));
        assert_eq!(frame.payload_str("content"), Some("hi"));
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = Frame::parse(r#"{"payload":{}}"#).unwrap_err();
        assert_eq!(err, FrameError::MissingType);
    }

    #[test]
    fn empty_or_non_string_type_is_rejected() {
        assert_eq!(
            Frame::parse(r#"{"type":"","payload":{}}"#).unwrap_err(),
            FrameError::MissingType
        );
        assert_eq!(
            Frame::parse(r#"{"type":7,"payload":{}}"#).unwrap_err(),
            FrameError::MissingType
        );
    }

    #[test]
    fn missing_payload_is_rejected() {
        let err = Frame::parse(r#"{"type":"message.created"}"#).unwrap_err();
        assert_matches!(err, FrameError::MissingPayload { frame_type } if frame_type == "message.created");
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = Frame::parse(r#"{"type":"ping","payload":"x"}"#).unwrap_err();
        assert_matches!(err, FrameError::MissingPayload { .. });
    }

    #[test]
    fn garbage_is_invalid_json() {
        assert_matches!(Frame::parse("not json"), Err(FrameError::InvalidJson(_)));
        assert_eq!(Frame::parse("[1,2]").unwrap_err(), FrameError::NotAnObject);
    }

    #[test]
    fn outbound_frames_satisfy_contract() {
        let id = LocalMessageId::from("loc_1");
        let text = Frame::message_send(&id, "hello", MessageRole::User).to_json();
        let back = Frame::parse(&text).unwrap();
        assert_eq!(back.frame_type, frame_types::MESSAGE_SEND);
        assert_eq!(back.payload_str("localId"), Some("loc_1"));
        assert_eq!(back.payload_str("role"), Some("user"));
    }

    #[test]
    fn new_replaces_non_object_payload() {
        let frame = Frame::new("ping", Value::Null);
        assert!(frame.payload.is_empty());
        assert!(Frame::parse(&frame.to_json()).is_ok());
    }
}
