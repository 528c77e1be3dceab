//! Background refresh scheduling.
//!
//! Watches the current access token and emits [`RefreshDue`] once the
//! lifecycle policy says it should be replaced. Each distinct token is
//! signalled at most once; a new token re-arms the scheduler, and so does
//! [`RefreshScheduler::retry_after`] once its delay has passed.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::credential::now_secs;
use crate::lifecycle::TokenLifecycleManager;

/// Signal that `token` should be refreshed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshDue {
    /// The token that is due.
    pub token: String,
}

/// Handle to the refresh timer task.
pub struct RefreshScheduler {
    task: JoinHandle<()>,
    retry_tx: mpsc::UnboundedSender<Duration>,
}

impl RefreshScheduler {
    /// Start watching `tokens`.
    ///
    /// The task re-evaluates at most every `check_interval` so wall-clock
    /// jumps (sleep, suspend) are noticed. It exits when `cancel` fires, the
    /// token channel closes, or the receiver is dropped.
    pub fn spawn(
        lifecycle: TokenLifecycleManager,
        mut tokens: watch::Receiver<Option<String>>,
        check_interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<RefreshDue>) {
        let (tx, rx) = mpsc::channel(4);
        let (retry_tx, mut retries) = mpsc::unbounded_channel::<Duration>();

        let task = tokio::spawn(async move {
            let mut signalled: Option<String> = None;
            let mut retry_at: Option<Instant> = None;
            let mut accepting_retries = true;
            loop {
                if retry_at.is_some_and(|at| Instant::now() >= at) {
                    debug!("retrying credential refresh");
                    retry_at = None;
                    signalled = None;
                }

                let current = tokens.borrow_and_update().clone();
                let wait = match current {
                    Some(token) if signalled.as_deref() != Some(token.as_str()) => {
                        match lifecycle.time_until_refresh(&token, now_secs()) {
                            Some(d) if d.is_zero() => {
                                debug!("credential refresh due");
                                if tx.send(RefreshDue { token: token.clone() }).await.is_err() {
                                    return;
                                }
                                signalled = Some(token);
                                None
                            }
                            Some(d) => Some(d.min(check_interval)),
                            None => None,
                        }
                    }
                    Some(_) => retry_at.map(|at| at.saturating_duration_since(Instant::now())),
                    None => None,
                };

                tokio::select! {
                    () = cancel.cancelled() => return,
                    changed = tokens.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        retry_at = None;
                    }
                    delay = retries.recv(), if accepting_retries => match delay {
                        Some(delay) => retry_at = Some(Instant::now() + delay),
                        None => accepting_retries = false,
                    },
                    () = sleep_for(wait) => {}
                }
            }
        });

        (Self { task, retry_tx }, rx)
    }

    /// Signal the current token again after `delay`, for when the refresh it
    /// triggered failed. A token change in the meantime supersedes the retry.
    /// Returns `false` once the task has stopped.
    pub fn retry_after(&self, delay: Duration) -> bool {
        self.retry_tx.send(delay).is_ok()
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
