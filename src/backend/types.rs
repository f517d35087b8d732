use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque session (lease) identifier assigned by the coordination service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generates a new random UUID v4-based SessionId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happens to the locks held by a session when it is destroyed or expires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// The lock is released, the key and its value stay.
    #[default]
    Release,
    /// The locked key is deleted.
    Delete,
}

impl SessionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionBehavior::Release => "release",
            SessionBehavior::Delete => "delete",
        }
    }
}

/// Parameters of a session creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    /// Human readable name, shown by the service's own tooling.
    pub name: Option<String>,
    /// Time-to-live; the session is invalidated if not renewed within it.
    pub ttl: Duration,
    pub behavior: SessionBehavior,
    /// Period after a release during which the lock cannot be re-acquired.
    pub lock_delay: Duration,
}

impl SessionRequest {
    pub fn new(ttl: Duration, behavior: SessionBehavior) -> Self {
        Self {
            name: None,
            ttl,
            behavior,
            lock_delay: Duration::ZERO,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Options of a (possibly blocking) read.
///
/// A `wait_index` of 0 means "no baseline": the read returns immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    pub wait_index: u64,
    /// Upper bound the server may hold the request open. `None` uses the server default.
    pub wait_time: Option<Duration>,
}

impl QueryOptions {
    pub fn blocking(wait_index: u64, wait_time: Option<Duration>) -> Self {
        Self {
            wait_index,
            wait_time,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.wait_index > 0
    }
}

/// Metadata returned alongside every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryMeta {
    /// Change index of the data returned; the cursor for the next blocking read.
    pub last_index: u64,
}

/// A single entry of the key/value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Session holding the lock on this key, if any.
    pub session: Option<SessionId>,
    pub create_index: u64,
    pub modify_index: u64,
    /// Number of times the lock has been acquired.
    pub lock_index: u64,
    pub flags: u64,
}

impl KvPair {
    /// Value rendered as UTF-8, lossy.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// One instance of a service as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogService {
    pub service_name: String,
    pub service_id: String,
    /// Service address, or the node address when the service has none.
    pub address: String,
    pub port: u16,
}

/// Health status reported for a TTL check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// TTL (dead man's switch) check attached to a service registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentServiceCheck {
    pub check_id: String,
    /// The check turns critical if no update arrives within this window.
    pub ttl: Duration,
    /// A service whose check stays critical this long is removed by the service.
    pub deregister_critical_after: Duration,
}

/// Registration of a service instance with the local agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentServiceRegistration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub check: AgentServiceCheck,
}
