//! Coordination Backend Module
//!
//! The single seam between this crate and the remote coordination service
//! (key/value store, service catalog, sessions and agent checks).
//!
//! ## Implementations
//! - **`http`**: `HttpBackend`, the Consul HTTP API v1 over `reqwest`.
//! - **`memory`**: `InMemoryBackend`, an in-process model with real blocking-query
//!   and session-expiry semantics, used by the tests and the `--in-memory` demo mode.
//!
//! Every component receives the backend as a shared `Arc<dyn CoordinationBackend>`
//! built once at startup and never mutated afterwards.

pub mod error;
pub mod http;
pub mod memory;
pub mod types;


pub use error::CoordinationError;
pub use types::{
    AgentServiceCheck, AgentServiceRegistration, CatalogService, HealthStatus, KvPair,
    QueryMeta, QueryOptions, SessionBehavior, SessionId, SessionRequest,
};

use async_trait::async_trait;
use std::sync::Arc;

/// Shared handle to a backend, injected into every component.
pub type SharedBackend = Arc<dyn CoordinationBackend>;

/// Operations consumed from the coordination service.
///
/// Reads take [`QueryOptions`]; when `wait_index` is non-zero the call blocks
/// server-side until the data's index moves past it or `wait_time` elapses.
#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Reads a key. `None` means the key does not exist.
    async fn kv_get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<(Option<KvPair>, QueryMeta), CoordinationError>;

    /// Writes a key and returns its new modify index.
    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<u64, CoordinationError>;

    /// Deletes a key. Deleting a missing key is not an error.
    async fn kv_delete(&self, key: &str) -> Result<(), CoordinationError>;

    /// Atomically takes the lock on `key` for `session` and writes `value`.
    ///
    /// Returns `Ok(false)` when another session holds the lock.
    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &SessionId,
    ) -> Result<bool, CoordinationError>;

    /// Lists the instances of a service. Unknown services yield an empty list.
    async fn catalog_service(
        &self,
        name: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CoordinationError>;

    async fn session_create(&self, req: &SessionRequest) -> Result<SessionId, CoordinationError>;

    /// Resets the session TTL. Fails with `LeaseInvalid` if the session is gone.
    async fn session_renew(&self, session: &SessionId) -> Result<(), CoordinationError>;

    async fn session_destroy(&self, session: &SessionId) -> Result<(), CoordinationError>;

    async fn agent_service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), CoordinationError>;

    /// Reports the status of a TTL check. Fails with `LeaseInvalid` if the check is unknown.
    async fn agent_check_update(
        &self,
        check_id: &str,
        status: HealthStatus,
    ) -> Result<(), CoordinationError>;

    async fn agent_service_deregister(&self, service_id: &str) -> Result<(), CoordinationError>;
}
