//! Periodic Keepalive Loop
//!
//! The loop shared by session renewal (`session::manager`) and TTL heartbeats
//! (`agent::heartbeat`): wake every `interval`, send one keepalive, repeat.
//!
//! - A transient failure is logged and the loop carries on; the lease may still
//!   be inside its TTL window.
//! - A `LeaseInvalid` answer ends the loop: the server no longer knows the lease,
//!   and the owner has to treat it as lost.
//! - Cancellation ends the loop before the next keepalive is sent. A keepalive
//!   already in flight is allowed to finish, so once the task has returned no
//!   request of ours can race a destroy/deregister. Backends bound a single
//!   keepalive request to less than the interval and never retry it; the next
//!   tick is the retry.

use crate::backend::CoordinationError;

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a keepalive loop stopped.
#[derive(Debug, Clone)]
pub enum KeepaliveOutcome {
    /// Stopped by its cancellation token.
    Cancelled,
    /// The server rejected the lease or check; it is gone.
    Invalidated(CoordinationError),
    /// The task panicked or was aborted.
    Failed(String),
}

impl KeepaliveOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KeepaliveOutcome::Cancelled)
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self, KeepaliveOutcome::Invalidated(_))
    }
}

/// Runs the keepalive loop on the current task until cancelled or invalidated.
pub async fn run_keepalive<F, Fut>(
    name: &str,
    interval: Duration,
    cancel: CancellationToken,
    mut beat: F,
) -> KeepaliveOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CoordinationError>>,
{
    tracing::info!("Periodically starting to renew '{}' every {:?}", name, interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Stopping to renew '{}'", name);
                return KeepaliveOutcome::Cancelled;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match beat().await {
            Ok(()) => {
                tracing::trace!("Renewed '{}'", name);
            }
            Err(e) if e.is_lease_invalid() => {
                tracing::error!("'{}' is no longer valid, stopping renewal: {}", name, e);
                return KeepaliveOutcome::Invalidated(e);
            }
            Err(e) => {
                tracing::warn!("Failed to renew '{}': {}", name, e);
            }
        }
    }
}

/// A keepalive loop running on its own task.
///
/// The loop publishes how it ended, so an owner can tell a lease the server
/// dropped apart from one that was simply cancelled.
pub struct KeepaliveHandle {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<KeepaliveOutcome>,
    outcome: watch::Receiver<Option<KeepaliveOutcome>>,
}

impl KeepaliveHandle {
    /// Spawns the loop with a child of `parent`, so cancelling the process-wide
    /// token stops it too.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        parent: &CancellationToken,
        beat: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CoordinationError>> + Send + 'static,
    {
        let name = name.into();
        let cancel = parent.child_token();
        let (outcome_tx, outcome) = watch::channel(None);

        let join = {
            let name = name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let outcome = run_keepalive(&name, interval, cancel, beat).await;
                outcome_tx.send_replace(Some(outcome.clone()));
                outcome
            })
        };

        Self {
            name,
            cancel,
            join,
            outcome,
        }
    }

    /// `true` once the loop has returned (cancelled, invalidated or crashed).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// `true` once the server rejected the lease. Never set by cancellation.
    pub fn is_invalidated(&self) -> bool {
        matches!(
            *self.outcome.borrow(),
            Some(KeepaliveOutcome::Invalidated(_))
        )
    }

    /// Resolves with the rejection once the server drops the lease. Pends
    /// forever if the loop ends any other way.
    pub async fn invalidated(&self) -> CoordinationError {
        let mut outcome = self.outcome.clone();

        let rejected = match outcome.wait_for(Option::is_some).await {
            Ok(ended) => match &*ended {
                Some(KeepaliveOutcome::Invalidated(e)) => Some(e.clone()),
                _ => None,
            },
            Err(_) => None,
        };

        match rejected {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }

    /// Signals the loop and waits until it has actually stopped.
    pub async fn stop(self) -> KeepaliveOutcome {
        self.cancel.cancel();

        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Keepalive task '{}' did not finish cleanly: {}", self.name, e);
                KeepaliveOutcome::Failed(e.to_string())
            }
        }
    }
}
