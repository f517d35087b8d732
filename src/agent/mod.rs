//! Agent Module
//!
//! Service registration with TTL health checks.
//!
//! ## Core Components
//! - **`ServiceRegistrar`**: Registers an instance under a unique id, drives its
//!   heartbeat and deregisters it on shutdown.
//! - **`HeartbeatPublisher`**: Periodic `passing` reports for a TTL check. When
//!   they stop, the agent marks the check critical and, after the grace window,
//!   removes the instance.
//! - **`listener`**: The registered service's own HTTP endpoint.
//!
//! ## Registration lifecycle
//! `Healthy -> Deregistered | ExpiredRemoved`

pub mod heartbeat;
pub mod listener;
pub mod registrar;
pub mod types;

#[cfg(test)]
mod tests;

pub use heartbeat::HeartbeatPublisher;
pub use registrar::{RegisteredService, ServiceRegistrar};
pub use types::{RegistrationId, RegistrationState, ServiceRegistration};
