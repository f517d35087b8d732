use crate::backend::{AgentServiceCheck, AgentServiceRegistration};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique id of one registered service instance, `"{name}-{uuid}"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub String);

impl RegistrationId {
    /// Generates a fresh id for an instance of `service`.
    pub fn generate(service: &str) -> Self {
        Self(format!("{}-{}", service, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the TTL check attached to this instance.
    pub fn check_id(&self) -> String {
        format!("service:{}", self.0)
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A service instance registered with a TTL check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: RegistrationId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub check_id: String,
    /// The check turns critical when not updated within this window.
    pub ttl: Duration,
    /// How long the check may stay critical before the agent removes the service.
    pub deregister_after: Duration,
}

impl ServiceRegistration {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        ttl: Duration,
        deregister_after: Duration,
    ) -> Self {
        let name = name.into();
        let id = RegistrationId::generate(&name);
        let check_id = id.check_id();

        Self {
            id,
            name,
            address: address.into(),
            port,
            check_id,
            ttl,
            deregister_after,
        }
    }

    pub fn to_agent(&self) -> AgentServiceRegistration {
        AgentServiceRegistration {
            id: self.id.0.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            check: AgentServiceCheck {
                check_id: self.check_id.clone(),
                ttl: self.ttl,
                deregister_critical_after: self.deregister_after,
            },
        }
    }
}

/// Lifecycle of a registration.
///
/// `Deregistered` and `ExpiredRemoved` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Registered and heartbeating.
    Healthy,
    /// Removed by us on shutdown.
    Deregistered,
    /// Removed by the agent after the check stayed critical past the grace window.
    ExpiredRemoved,
}

impl RegistrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationState::Deregistered | RegistrationState::ExpiredRemoved
        )
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            RegistrationState::Healthy => "healthy",
            RegistrationState::Deregistered => "deregistered",
            RegistrationState::ExpiredRemoved => "expired and removed",
        };
        f.write_str(state)
    }
}
