//! Lease-based coordination on top of a Consul-style coordination service.
//!
//! - `watch`: blocking-query watchers for a key or a service's instances.
//! - `session`: leases kept alive by periodic renewal, and locks owned by them.
//! - `agent`: service registration kept healthy by TTL heartbeats.
//! - `backend`: the service API, over HTTP or in memory.

pub mod agent;
pub mod backend;
pub mod config;
pub mod keepalive;
pub mod session;
pub mod shutdown;
pub mod watch;
