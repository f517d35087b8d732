//! Lease Manager
//!
//! Owns the lifecycle of a session: create it, renew it on a background task,
//! and destroy it once. Destruction only happens after the renewal task has
//! confirmed it stopped, so a late renew can never race the destroy.

use super::types::Lease;
use crate::backend::{CoordinationError, SessionBehavior, SessionId, SessionRequest, SharedBackend};
use crate::config::{validate_keepalive, validate_session_ttl};
use crate::keepalive::{KeepaliveHandle, KeepaliveOutcome, run_keepalive};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type RenewFuture = Pin<Box<dyn Future<Output = Result<(), CoordinationError>> + Send>>;

#[derive(Clone)]
pub struct LeaseManager {
    backend: SharedBackend,
}

impl LeaseManager {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Creates a new lease. Fails fast on an out-of-range TTL.
    pub async fn create(
        &self,
        ttl: Duration,
        behavior: SessionBehavior,
    ) -> Result<Lease, CoordinationError> {
        validate_session_ttl(ttl)?;

        let request = SessionRequest::new(ttl, behavior);
        let id = self.backend.session_create(&request).await?;
        tracing::info!("New session created: {}", id);

        Ok(Lease { id, ttl, behavior })
    }

    /// Renews `id` every `interval` on the current task until `cancel` fires
    /// or the server reports the session gone.
    pub async fn renew_loop(
        &self,
        id: &SessionId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> KeepaliveOutcome {
        run_keepalive(id.as_str(), interval, cancel, self.renewer(id)).await
    }

    /// Starts the renewal loop on its own task.
    pub fn spawn_renewal(
        &self,
        lease: &Lease,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Result<KeepaliveHandle, CoordinationError> {
        validate_keepalive(lease.ttl, interval)?;

        Ok(KeepaliveHandle::spawn(
            lease.id.as_str(),
            interval,
            parent,
            self.renewer(&lease.id),
        ))
    }

    /// Destroys the lease. Failures are logged, never returned: during shutdown
    /// the session will expire on its own anyway.
    pub async fn destroy(&self, lease: Lease) {
        match self.backend.session_destroy(&lease.id).await {
            Ok(()) => tracing::info!("Session {} destroyed", lease.id),
            Err(e) => tracing::warn!(
                "Failed to destroy session {} (it will expire after {:?}): {}",
                lease.id,
                lease.ttl,
                e
            ),
        }
    }

    /// Stops renewal, waits for the loop to end, then destroys the lease.
    pub async fn shutdown(&self, lease: Lease, renewal: KeepaliveHandle) -> KeepaliveOutcome {
        let outcome = renewal.stop().await;

        if outcome.is_invalidated() {
            tracing::warn!("Session {} was already gone before shutdown", lease.id);
        } else {
            self.destroy(lease).await;
        }

        outcome
    }

    /// Creates a lease and starts renewing it.
    pub async fn start(
        &self,
        ttl: Duration,
        behavior: SessionBehavior,
        renew_interval: Duration,
        parent: &CancellationToken,
    ) -> Result<ActiveLease, CoordinationError> {
        validate_keepalive(ttl, renew_interval)?;

        let lease = self.create(ttl, behavior).await?;
        let renewal = self.spawn_renewal(&lease, renew_interval, parent)?;

        Ok(ActiveLease {
            lease,
            renewal,
            manager: self.clone(),
        })
    }

    fn renewer(&self, id: &SessionId) -> impl FnMut() -> RenewFuture + Send + 'static {
        let backend = self.backend.clone();
        let id = id.clone();

        move || {
            let backend = backend.clone();
            let id = id.clone();
            Box::pin(async move { backend.session_renew(&id).await }) as RenewFuture
        }
    }
}

/// A lease together with its running renewal loop.
pub struct ActiveLease {
    lease: Lease,
    renewal: KeepaliveHandle,
    manager: LeaseManager,
}

impl ActiveLease {
    pub fn id(&self) -> &SessionId {
        &self.lease.id
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// `true` once the server dropped the session. Cancellation does not count.
    pub fn is_lost(&self) -> bool {
        self.renewal.is_invalidated()
    }

    /// Resolves when the server drops the session.
    pub async fn lost(&self) -> CoordinationError {
        self.renewal.invalidated().await
    }

    /// Ordered teardown: stop renewing, wait, destroy.
    pub async fn release(self) -> KeepaliveOutcome {
        self.manager.shutdown(self.lease, self.renewal).await
    }
}
