//! Transport seam.
//!
//! A [`Transport`] never calls back into the session. It reports everything
//! (open, inbound text, errors, close) by pushing [`TransportEvent`]s into
//! the [`EventSink`] it was handed at connect time. Each sink is stamped
//! with the connection generation it belongs to, so events from an
//! abandoned socket can be told apart from the current one.

pub mod websocket;

use tokio::sync::mpsc;

pub use websocket::WebSocketTransport;

/// Something that happened on a socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed.
    Opened,
    /// Inbound text frame.
    Message(String),
    /// Non-terminal error report; a `Closed` follows if the socket is gone.
    Error(String),
    /// Socket closed or handshake refused.
    Closed {
        /// WebSocket close code, when one was received.
        code: Option<u16>,
        /// Close reason or failure description.
        reason: String,
        /// Whether the server refused the credential.
        auth_rejected: bool,
    },
}

/// A [`TransportEvent`] stamped with its connection generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedEvent {
    /// Generation of the connect call that produced the event.
    pub generation: u64,
    /// The event.
    pub event: TransportEvent,
}

/// Where a transport reports events for one connection.
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    /// Sink for `generation` feeding `tx`.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sink reports for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Returns `false` once nobody is listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// A bidirectional text channel to the backend.
///
/// All methods are synchronous and must not block; `connect` starts the
/// attempt in the background and reports its outcome through the sink.
pub trait Transport: Send + Sync {
    /// Start connecting to `url`, replacing any previous connection.
    fn connect(&self, url: &str, token: Option<&str>, sink: EventSink);

    /// Queue one text frame. `false` when there is no open socket or the
    /// outbound buffer is full.
    fn send(&self, text: &str) -> bool;

    /// Close the current connection, if any.
    fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert_eq!(sink.generation(), 7);
        assert!(sink.emit(TransportEvent::Opened));
        assert_eq!(
            rx.recv().await.unwrap(),
            TaggedEvent {
                generation: 7,
                event: TransportEvent::Opened
            }
        );
    }

    #[test]
    fn sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(!EventSink::new(1, tx).emit(TransportEvent::Opened));
    }
}
