//! Lock Coordinator
//!
//! Mutual exclusion on a key, owned by a lease. Acquisition is a single atomic
//! call: there is no retry loop and no explicit release. The lock goes away with
//! the lease, when it is destroyed or when it expires.

use super::manager::{ActiveLease, LeaseManager};
use super::types::LockState;
use crate::backend::{
    CoordinationError, QueryOptions, SessionBehavior, SessionId, SharedBackend,
};
use crate::keepalive::KeepaliveOutcome;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct LockCoordinator {
    backend: SharedBackend,
    manager: LeaseManager,
}

impl LockCoordinator {
    pub fn new(backend: SharedBackend) -> Self {
        let manager = LeaseManager::new(backend.clone());
        Self { backend, manager }
    }

    pub fn with_manager(backend: SharedBackend, manager: LeaseManager) -> Self {
        Self { backend, manager }
    }

    pub fn manager(&self) -> &LeaseManager {
        &self.manager
    }

    /// Tries to take the lock on `key` for `session`, writing `value`.
    ///
    /// `Ok(false)` means another session holds it.
    pub async fn acquire(
        &self,
        key: &str,
        value: &str,
        session: &SessionId,
    ) -> Result<bool, CoordinationError> {
        let acquired = self
            .backend
            .kv_acquire(key, value.as_bytes(), session)
            .await?;

        if acquired {
            tracing::info!("'{}' key lock acquired", key);
        } else {
            tracing::info!("Can't acquire '{}' key lock, held by another session", key);
        }

        Ok(acquired)
    }

    /// Like [`acquire`](Self::acquire), with lost contention as an error.
    pub async fn acquire_or_contend(
        &self,
        key: &str,
        value: &str,
        session: &SessionId,
    ) -> Result<(), CoordinationError> {
        if self.acquire(key, value, session).await? {
            Ok(())
        } else {
            Err(CoordinationError::contention(key))
        }
    }

    /// Current holder of `key`, seen from `session`.
    pub async fn lock_state(
        &self,
        key: &str,
        session: &SessionId,
    ) -> Result<LockState, CoordinationError> {
        let (pair, _) = self.backend.kv_get(key, QueryOptions::default()).await?;
        Ok(LockState::observe(pair.as_ref(), session))
    }

    /// Creates a renewed lease and takes the lock with it.
    ///
    /// Returns `None` on lost contention; the lease is torn down again before
    /// returning, as it is on any acquire error.
    pub async fn hold(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        behavior: SessionBehavior,
        renew_interval: Duration,
        parent: &CancellationToken,
    ) -> Result<Option<HeldLock>, CoordinationError> {
        let lease = self
            .manager
            .start(ttl, behavior, renew_interval, parent)
            .await?;

        match self.acquire(key, value, lease.id()).await {
            Ok(true) => Ok(Some(HeldLock {
                key: key.to_string(),
                lease,
            })),
            Ok(false) => {
                lease.release().await;
                Ok(None)
            }
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }
}

/// A lock held through a renewed lease.
pub struct HeldLock {
    key: String,
    lease: ActiveLease,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &SessionId {
        self.lease.id()
    }

    /// `true` once the server dropped the lease, and with it the lock.
    pub fn is_lost(&self) -> bool {
        self.lease.is_lost()
    }

    /// Resolves when the lease, and with it the lock, is lost.
    pub async fn lost(&self) -> CoordinationError {
        self.lease.lost().await
    }

    /// Holds the lock until `cancel` fires or the lease is lost, then releases
    /// it. An `Invalidated` outcome means the lock was lost while held.
    pub async fn run_until(self, cancel: &CancellationToken) -> KeepaliveOutcome {
        let lost = tokio::select! {
            _ = cancel.cancelled() => None,
            e = self.lost() => Some(e),
        };

        if let Some(e) = lost {
            tracing::error!("Session {} is gone, '{}' key lock lost: {}", self.session(), self.key, e);
        }

        self.release().await
    }

    /// Stops renewing and destroys the lease, which releases (or deletes) the key.
    pub async fn release(self) -> KeepaliveOutcome {
        tracing::info!("Releasing '{}' key lock", self.key);
        self.lease.release().await
    }
}
