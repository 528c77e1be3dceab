//! Connection state machine.
//!
//! [`transition`] is a pure reducer: given the current [`Machine`] and one
//! [`Input`] it returns the next machine and the [`Effect`]s the caller must
//! perform. It never touches a socket or a timer itself.
//!
//! ```text
//!   Closed ──connect──▶ Connecting ──opened──▶ Open
//!     ▲                    │                    │
//!     │◀──closed (retry)───┴────────────────────┘
//!     │◀──close completed── Closing ◀──disconnect (any state)
//! ```
//!
//! Every connect attempt gets a new generation; inputs stamped with an older
//! generation are ignored.
//!
//! A close the server attributes to the credential does not arm the backoff
//! timer directly: the machine waits for the refresh to report back
//! ([`Input::RefreshCompleted`]) and only then schedules the reconnect.

use serde::Serialize;
use tether_core::{ErrorCategory, ReconnectPolicy};

/// Lifecycle state of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; frames flow.
    Open,
    /// Tearing down at the caller's request.
    Closing,
    /// No socket.
    Closed,
}

/// Snapshot of the connection for the UI. Always readable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Reconnect attempt in progress or scheduled (0 when not retrying).
    pub attempt: u32,
    /// A reconnect is scheduled or in progress.
    pub retrying: bool,
    /// Reconnects are exhausted; `connect()` must be called again.
    pub failed: bool,
    /// Category of the last failure.
    pub last_error: Option<ErrorCategory>,
}

impl ConnectionStatus {
    /// Whether frames can be sent.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Full reducer state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Machine {
    state: ConnectionState,
    generation: u64,
    attempt: u32,
    retrying: bool,
    failed: bool,
    awaiting_credential: bool,
    last_error: Option<ErrorCategory>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Closed,
            generation: 0,
            attempt: 0,
            retrying: false,
            failed: false,
            awaiting_credential: false,
            last_error: None,
        }
    }
}

impl Machine {
    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the current (or last) connect attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The next reconnect is held until a credential refresh finishes.
    pub fn awaiting_credential(&self) -> bool {
        self.awaiting_credential
    }

    /// UI snapshot.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt: self.attempt,
            retrying: self.retrying,
            failed: self.failed,
            last_error: self.last_error,
        }
    }
}

/// How a credential refresh ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new access token is in the context.
    Refreshed,
    /// The refresh failed for a reason that may clear up (network, server).
    Failed,
    /// The credential was rejected and the session signed out.
    SignedOut,
    /// No refresher is configured.
    Unavailable,
}

/// Something the reducer reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Caller asked to connect.
    Connect,
    /// Caller asked to disconnect.
    Disconnect,
    /// Transport teardown finished.
    CloseCompleted,
    /// Handshake completed.
    Opened {
        /// Generation of the socket.
        generation: u64,
    },
    /// Transport reported a non-terminal error.
    Errored {
        /// Generation of the socket.
        generation: u64,
    },
    /// Socket closed or handshake refused.
    Closed {
        /// Generation of the socket.
        generation: u64,
        /// The server refused the credential.
        auth_rejected: bool,
    },
    /// Backoff timer fired.
    ReconnectDue {
        /// Generation the timer was scheduled for.
        generation: u64,
    },
    /// The credential debounce window elapsed; `token` is the latest value.
    CredentialSettled {
        /// Current access token.
        token: Option<String>,
    },
    /// The transport refused the renegotiation frame.
    RenegotiationRefused,
    /// A credential refresh finished.
    RefreshCompleted {
        /// How it ended.
        outcome: RefreshOutcome,
    },
    /// A reconnect for `generation` found no credential to present.
    CredentialMissing {
        /// Generation of the abandoned attempt.
        generation: u64,
    },
}

/// Work the caller performs after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Open a socket for `generation` with the current credential.
    OpenTransport {
        /// Generation to stamp on the socket's events.
        generation: u64,
    },
    /// Close the socket.
    CloseTransport,
    /// Feed [`Input::CloseCompleted`] back once the socket is closed.
    FinishClose,
    /// Send frames buffered while connecting.
    FlushQueue,
    /// Discard frames buffered while connecting.
    DropQueue,
    /// Start the backoff timer for a 1-based reconnect `attempt`.
    ScheduleReconnect {
        /// Attempt number.
        attempt: u32,
        /// Generation the timer belongs to.
        generation: u64,
    },
    /// Cancel the backoff timer.
    CancelReconnect,
    /// Cancel the pending credential update.
    CancelCredentialUpdate,
    /// Send `auth.renegotiate` with `token`.
    Renegotiate {
        /// New access token.
        token: String,
    },
    /// Obtain a new credential before the next attempt.
    RefreshCredential,
    /// Report that reconnects are exhausted.
    SurfaceFailure {
        /// Attempts made.
        attempts: u32,
    },
}

/// Apply one input.
pub fn transition(machine: &Machine, input: Input, policy: &ReconnectPolicy) -> (Machine, Vec<Effect>) {
    let mut next = machine.clone();
    let mut effects = Vec::new();

    match input {
        Input::Connect => match machine.state {
            ConnectionState::Connecting | ConnectionState::Open => {}
            ConnectionState::Closed | ConnectionState::Closing => {
                next.generation += 1;
                next.state = ConnectionState::Connecting;
                next.attempt = 0;
                next.retrying = false;
                next.failed = false;
                next.awaiting_credential = false;
                effects.push(Effect::CancelReconnect);
                effects.push(Effect::OpenTransport {
                    generation: next.generation,
                });
            }
        },

        Input::Disconnect => begin_close(&mut next, &mut effects),

        Input::CloseCompleted => {
            if machine.state == ConnectionState::Closing {
                next.state = ConnectionState::Closed;
            }
        }

        Input::Opened { generation } => {
            if generation == machine.generation && machine.state == ConnectionState::Connecting {
                next.state = ConnectionState::Open;
                next.attempt = 0;
                next.retrying = false;
                next.awaiting_credential = false;
                next.failed = false;
                next.last_error = None;
                effects.push(Effect::FlushQueue);
            }
        }

        Input::Errored { generation } => {
            if generation == machine.generation && is_live(machine.state) {
                next.last_error = Some(ErrorCategory::Network);
            }
        }

        Input::Closed {
            generation,
            auth_rejected,
        } => {
            if generation == machine.generation && is_live(machine.state) {
                next.state = ConnectionState::Closed;
                next.last_error = Some(if auth_rejected {
                    ErrorCategory::Auth
                } else {
                    ErrorCategory::Network
                });
                if auth_rejected {
                    effects.push(Effect::RefreshCredential);
                }
                if policy.allows(machine.attempt) {
                    next.attempt = machine.attempt + 1;
                    next.retrying = true;
                    if auth_rejected {
                        next.awaiting_credential = true;
                    } else {
                        effects.push(Effect::ScheduleReconnect {
                            attempt: next.attempt,
                            generation: next.generation,
                        });
                    }
                } else {
                    next.retrying = false;
                    next.failed = true;
                    effects.push(Effect::DropQueue);
                    effects.push(Effect::SurfaceFailure {
                        attempts: machine.attempt,
                    });
                }
            }
        }

        Input::ReconnectDue { generation } => {
            if generation == machine.generation
                && machine.state == ConnectionState::Closed
                && machine.retrying
                && !machine.awaiting_credential
            {
                next.generation += 1;
                next.state = ConnectionState::Connecting;
                effects.push(Effect::OpenTransport {
                    generation: next.generation,
                });
            }
        }

        Input::CredentialSettled { token } => match (machine.state, token) {
            (ConnectionState::Open, Some(token)) => effects.push(Effect::Renegotiate { token }),
            (ConnectionState::Connecting, Some(_)) => restart(&mut next, &mut effects),
            (ConnectionState::Open | ConnectionState::Connecting, None) => {
                begin_close(&mut next, &mut effects);
            }
            (ConnectionState::Closed, None) if machine.retrying => {
                stop_retrying(&mut next, &mut effects);
            }
            _ => {}
        },

        Input::RenegotiationRefused => {
            if machine.state == ConnectionState::Open {
                restart(&mut next, &mut effects);
            }
        }

        Input::RefreshCompleted { outcome } => {
            if machine.awaiting_credential
                && machine.state == ConnectionState::Closed
                && machine.retrying
            {
                next.awaiting_credential = false;
                match outcome {
                    RefreshOutcome::SignedOut => stop_retrying(&mut next, &mut effects),
                    RefreshOutcome::Refreshed
                    | RefreshOutcome::Failed
                    | RefreshOutcome::Unavailable => {
                        effects.push(Effect::ScheduleReconnect {
                            attempt: machine.attempt,
                            generation: machine.generation,
                        });
                    }
                }
            }
        }

        Input::CredentialMissing { generation } => {
            if generation == machine.generation && machine.state == ConnectionState::Connecting {
                next.state = ConnectionState::Closed;
                next.last_error = Some(ErrorCategory::Auth);
                stop_retrying(&mut next, &mut effects);
            }
        }
    }

    (next, effects)
}

fn is_live(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connecting | ConnectionState::Open)
}

/// Drop the current socket and open a new one with the current credential.
fn restart(next: &mut Machine, effects: &mut Vec<Effect>) {
    next.generation += 1;
    next.state = ConnectionState::Connecting;
    effects.push(Effect::CloseTransport);
    effects.push(Effect::OpenTransport {
        generation: next.generation,
    });
}

/// Abandon a scheduled or pending reconnect; the machine stays `Closed`.
fn stop_retrying(next: &mut Machine, effects: &mut Vec<Effect>) {
    next.attempt = 0;
    next.retrying = false;
    next.awaiting_credential = false;
    effects.extend([Effect::CancelReconnect, Effect::DropQueue]);
}

fn begin_close(next: &mut Machine, effects: &mut Vec<Effect>) {
    next.generation += 1;
    next.state = ConnectionState::Closing;
    next.attempt = 0;
    next.retrying = false;
    next.failed = false;
    next.awaiting_credential = false;
    effects.extend([
        Effect::CancelReconnect,
        Effect::CancelCredentialUpdate,
        Effect::DropQueue,
        Effect::CloseTransport,
        Effect::FinishClose,
    ]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
