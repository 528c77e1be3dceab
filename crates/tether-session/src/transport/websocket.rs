//! WebSocket transport over `tokio-tungstenite`.
//!
//! The bearer token travels in the `Authorization` header of the upgrade
//! request. A 401/403 upgrade refusal or a 4401/4403 close code is reported
//! as `auth_rejected`.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{EventSink, Transport, TransportEvent};
use crate::errors::{TransportError, is_auth_close_code};

/// Default outbound buffer per socket.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

struct ActiveSocket {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// [`Transport`] backed by a real WebSocket.
pub struct WebSocketTransport {
    active: Mutex<Option<ActiveSocket>>,
    outbound_capacity: usize,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl WebSocketTransport {
    /// Transport buffering up to `outbound_capacity` frames per socket.
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            active: Mutex::new(None),
            outbound_capacity: outbound_capacity.max(1),
        }
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str, token: Option<&str>, sink: EventSink) {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let cancel = CancellationToken::new();
        let previous = self.active.lock().replace(ActiveSocket {
            tx,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let _ = tokio::spawn(run_socket(
            url.to_string(),
            token.map(str::to_string),
            sink,
            rx,
            cancel,
        ));
    }

    fn send(&self, text: &str) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|socket| socket.tx.try_send(text.to_string()).is_ok())
    }

    fn disconnect(&self) {
        if let Some(socket) = self.active.lock().take() {
            socket.cancel.cancel();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Build the upgrade request, attaching the bearer token.
pub fn build_request(url: &str, token: Option<&str>) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let _ = request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

fn classify(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => TransportError::HandshakeRefused {
            status: response.status().as_u16(),
        },
        other => TransportError::Connect(other.to_string()),
    }
}

fn report_failure(sink: &EventSink, err: &TransportError) {
    warn!(error = %err, category = %err.category(), "websocket failure");
    let _ = sink.emit(TransportEvent::Error(err.to_string()));
    let _ = sink.emit(TransportEvent::Closed {
        code: None,
        reason: err.to_string(),
        auth_rejected: err.is_auth_rejection(),
    });
}

#[instrument(skip_all, fields(generation = sink.generation()))]
async fn run_socket(
    url: String,
    token: Option<String>,
    sink: EventSink,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let request = match build_request(&url, token.as_deref()) {
        Ok(request) => request,
        Err(e) => {
            report_failure(&sink, &e);
            return;
        }
    };

    let connected = tokio::select! {
        () = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(request) => result,
    };
    let stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            report_failure(&sink, &classify(e));
            return;
        }
    };

    info!(%url, "websocket open");
    let _ = sink.emit(TransportEvent::Opened);
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                debug!("websocket closed by client");
                return;
            }
            text = outbound.recv() => {
                let Some(text) = text else {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    report_failure(&sink, &TransportError::Connect(e.to_string()));
                    return;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = sink.emit(TransportEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        let _ = sink.emit(TransportEvent::Message(text.to_string()));
                    } else {
                        debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((None, String::new()), |f| {
                        (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                    });
                    let auth_rejected = code.is_some_and(is_auth_close_code);
                    info!(?code, %reason, auth_rejected, "websocket closed by server");
                    let _ = sink.emit(TransportEvent::Closed { code, reason, auth_rejected });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    report_failure(&sink, &TransportError::Connect(e.to_string()));
                    return;
                }
                None => {
                    let _ = sink.emit(TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".into(),
                        auth_rejected: false,
                    });
                    return;
                }
            }
        }
    }
}
