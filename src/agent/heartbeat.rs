//! Heartbeat Publisher
//!
//! Dead-man's switch for a TTL check: report `passing` every interval, and let
//! the agent mark the service critical when the reports stop. Same loop as
//! session renewal, with a check update as the beat.

use crate::backend::{CoordinationError, HealthStatus, SharedBackend};
use crate::keepalive::{KeepaliveHandle, KeepaliveOutcome, run_keepalive};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type BeatFuture = Pin<Box<dyn Future<Output = Result<(), CoordinationError>> + Send>>;

#[derive(Clone)]
pub struct HeartbeatPublisher {
    backend: SharedBackend,
}

impl HeartbeatPublisher {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Sends one status report for `check_id`.
    pub async fn publish(
        &self,
        check_id: &str,
        status: HealthStatus,
    ) -> Result<(), CoordinationError> {
        self.backend.agent_check_update(check_id, status).await?;
        tracing::debug!("Check {} reported {}", check_id, status.as_str());
        Ok(())
    }

    /// Reports `passing` every `interval` on the current task until cancelled
    /// or the agent no longer knows the check.
    pub async fn run(
        &self,
        check_id: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> KeepaliveOutcome {
        run_keepalive(check_id, interval, cancel, self.beater(check_id)).await
    }

    /// Starts the heartbeat loop on its own task.
    pub fn spawn(
        &self,
        check_id: &str,
        interval: Duration,
        parent: &CancellationToken,
    ) -> KeepaliveHandle {
        KeepaliveHandle::spawn(check_id, interval, parent, self.beater(check_id))
    }

    fn beater(&self, check_id: &str) -> impl FnMut() -> BeatFuture + Send + 'static {
        let backend = self.backend.clone();
        let check = check_id.to_string();

        move || {
            let backend = backend.clone();
            let check = check.clone();
            Box::pin(async move { backend.agent_check_update(&check, HealthStatus::Passing).await })
                as BeatFuture
        }
    }
}
