//! Service Registrar
//!
//! Registers a service instance with a TTL check, keeps the check passing, and
//! removes the instance on shutdown. Teardown order is fixed: stop the heartbeat,
//! wait for its task to end, then deregister.

use super::heartbeat::HeartbeatPublisher;
use super::types::{RegistrationId, RegistrationState, ServiceRegistration};
use crate::backend::{CoordinationError, HealthStatus, SharedBackend};
use crate::config::{CoordinatorConfig, validate_keepalive};
use crate::keepalive::KeepaliveHandle;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ServiceRegistrar {
    backend: SharedBackend,
    heartbeat: HeartbeatPublisher,
    ttl: Duration,
    deregister_after: Duration,
    heartbeat_interval: Duration,
}

impl ServiceRegistrar {
    pub fn new(backend: SharedBackend) -> Self {
        Self::from_config(backend, &CoordinatorConfig::default())
    }

    pub fn from_config(backend: SharedBackend, config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat: HeartbeatPublisher::new(backend.clone()),
            backend,
            ttl: config.service_ttl,
            deregister_after: config.deregister_after,
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    /// Registers a new instance of `name` with a TTL check. The check starts
    /// critical until the first heartbeat.
    pub async fn register(
        &self,
        name: &str,
        address: &str,
        port: u16,
        ttl: Duration,
        deregister_after: Duration,
    ) -> Result<ServiceRegistration, CoordinationError> {
        if name.is_empty() {
            return Err(CoordinationError::configuration("service name must not be empty"));
        }
        if ttl.is_zero() || deregister_after.is_zero() {
            return Err(CoordinationError::configuration(
                "check TTL and deregister window must be greater than zero",
            ));
        }

        let registration = ServiceRegistration::new(name, address, port, ttl, deregister_after);
        self.backend
            .agent_service_register(&registration.to_agent())
            .await?;

        tracing::info!(
            "Service {} registered as {} at {}:{}",
            name,
            registration.id,
            address,
            port
        );

        Ok(registration)
    }

    /// Starts the heartbeat loop for `registration`.
    pub fn start_heartbeat(
        &self,
        registration: &ServiceRegistration,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Result<KeepaliveHandle, CoordinationError> {
        validate_keepalive(registration.ttl, interval)?;
        Ok(self.heartbeat.spawn(&registration.check_id, interval, parent))
    }

    pub async fn deregister(&self, id: &RegistrationId) -> Result<(), CoordinationError> {
        self.backend.agent_service_deregister(id.as_str()).await?;
        tracing::info!("Service {} deregistered", id);
        Ok(())
    }

    /// Register, report healthy once, then keep heartbeating in the background.
    ///
    /// If the first heartbeat fails the instance is deregistered again.
    pub async fn run(
        &self,
        name: &str,
        address: &str,
        port: u16,
        parent: &CancellationToken,
    ) -> Result<RegisteredService, CoordinationError> {
        validate_keepalive(self.ttl, self.heartbeat_interval)?;

        let registration = self
            .register(name, address, port, self.ttl, self.deregister_after)
            .await?;

        if let Err(e) = self
            .heartbeat
            .publish(&registration.check_id, HealthStatus::Passing)
            .await
        {
            tracing::error!("First heartbeat of {} failed: {}", registration.id, e);
            if let Err(cleanup) = self.deregister(&registration.id).await {
                tracing::warn!("Failed to deregister {}: {}", registration.id, cleanup);
            }
            return Err(e);
        }

        let heartbeat = self.start_heartbeat(&registration, self.heartbeat_interval, parent)?;

        Ok(RegisteredService {
            registration,
            heartbeat,
            registrar: self.clone(),
        })
    }
}

/// A healthy registration with its running heartbeat.
pub struct RegisteredService {
    registration: ServiceRegistration,
    heartbeat: KeepaliveHandle,
    registrar: ServiceRegistrar,
}

impl RegisteredService {
    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    pub fn id(&self) -> &RegistrationId {
        &self.registration.id
    }

    /// `false` once the heartbeat loop has ended, whether cancelled or because
    /// the agent no longer knows the check.
    pub fn is_heartbeating(&self) -> bool {
        !self.heartbeat.is_finished()
    }

    /// `true` once the agent rejected a heartbeat because it already removed
    /// the instance. Cancellation does not count.
    pub fn is_expired(&self) -> bool {
        self.heartbeat.is_invalidated()
    }

    /// Resolves when the agent reports the instance gone.
    pub async fn expired(&self) -> CoordinationError {
        self.heartbeat.invalidated().await
    }

    /// Keeps the instance registered until `cancel` fires or the agent drops
    /// it, then shuts down. `ExpiredRemoved` means the instance was lost while
    /// the process was still serving.
    pub async fn run_until(
        self,
        cancel: &CancellationToken,
    ) -> Result<RegistrationState, CoordinationError> {
        let expired = tokio::select! {
            _ = cancel.cancelled() => None,
            e = self.expired() => Some(e),
        };

        if let Some(e) = expired {
            tracing::error!("Service {} is no longer registered: {}", self.registration.id, e);
        }

        self.shutdown().await
    }

    /// Stops the heartbeat, waits for it, then deregisters.
    pub async fn shutdown(self) -> Result<RegistrationState, CoordinationError> {
        let outcome = self.heartbeat.stop().await;

        if outcome.is_invalidated() {
            tracing::warn!(
                "Service {} was removed by the agent after missing its heartbeats",
                self.registration.id
            );
            return Ok(RegistrationState::ExpiredRemoved);
        }

        self.registrar.deregister(&self.registration.id).await?;
        Ok(RegistrationState::Deregistered)
    }
}
