//! In-Memory Coordination Backend
//!
//! An in-process model of the coordination service, faithful enough to exercise
//! every client-side protocol in this crate:
//! - **Change index**: a single global counter bumped by every mutation. Reads
//!   report the index of the data they return; blocking reads park on a
//!   `tokio::sync::watch` channel until that index moves past `wait_index`.
//! - **Sessions**: expire when not renewed within their TTL. Expiry and destroy
//!   release or delete the keys they lock, depending on `SessionBehavior`.
//! - **TTL checks**: turn critical when not updated within their TTL; a service
//!   critical for longer than `deregister_critical_after` is removed.
//! - **Test hooks**: every call is recorded, and transport failures can be injected.
//!
//! Reads go straight to the `DashMap`s; all mutations pass through a single write
//! gate so that acquire, destroy and expiry never interleave.

use super::error::CoordinationError;
use super::types::*;
use super::CoordinationBackend;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(300);

/// Blocked readers re-check expirations at least this often.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// A call received by the backend, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    KvGet { key: String, wait_index: u64 },
    KvPut { key: String },
    KvDelete { key: String },
    KvAcquire { key: String, session: SessionId },
    CatalogService { name: String, wait_index: u64 },
    SessionCreate,
    SessionRenew(SessionId),
    SessionDestroy(SessionId),
    ServiceRegister(String),
    CheckUpdate(String),
    ServiceDeregister(String),
}

#[derive(Debug, Clone)]
struct SessionEntry {
    ttl: Duration,
    behavior: SessionBehavior,
    last_renewed: Instant,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    registration: AgentServiceRegistration,
    status: HealthStatus,
    last_update: Instant,
    critical_since: Option<Instant>,
}

pub struct InMemoryBackend {
    kv: DashMap<String, KvPair>,
    /// Index at which a key was last deleted, so watchers of a removed key wake up.
    tombstones: DashMap<String, u64>,
    sessions: DashMap<SessionId, SessionEntry>,
    /// Keyed by service id.
    services: DashMap<String, ServiceEntry>,
    /// Keyed by service name.
    service_indexes: DashMap<String, u64>,

    index: AtomicU64,
    kv_table_index: AtomicU64,
    catalog_table_index: AtomicU64,
    index_tx: watch::Sender<u64>,
    write_gate: Mutex<()>,

    default_wait: Duration,
    calls: Mutex<Vec<BackendCall>>,
    fail_next: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);

        Self {
            kv: DashMap::new(),
            tombstones: DashMap::new(),
            sessions: DashMap::new(),
            services: DashMap::new(),
            service_indexes: DashMap::new(),
            index: AtomicU64::new(0),
            kv_table_index: AtomicU64::new(0),
            catalog_table_index: AtomicU64::new(0),
            index_tx,
            write_gate: Mutex::new(()),
            default_wait: DEFAULT_WAIT_TIME,
            calls: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Server-side wait applied when a blocking read does not ask for one.
    pub fn with_default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    // --- Test hooks ---

    /// The next `count` calls fail with a transport error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Snapshot of every call received so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock_calls().clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock_calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn renew_count(&self, session: &SessionId) -> usize {
        self.count_calls(|call| matches!(call, BackendCall::SessionRenew(id) if id == session))
    }

    pub fn check_update_count(&self, check_id: &str) -> usize {
        self.count_calls(|call| matches!(call, BackendCall::CheckUpdate(id) if id == check_id))
    }

    /// Wait indexes of every KV read of `key`, in order.
    pub fn kv_wait_indexes(&self, key: &str) -> Vec<u64> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                BackendCall::KvGet { key: k, wait_index } if k == key => Some(*wait_index),
                _ => None,
            })
            .collect()
    }

    pub fn current_index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    pub fn session_exists(&self, session: &SessionId) -> bool {
        self.reap_expired();
        self.sessions.contains_key(session)
    }

    pub fn service_registered(&self, service_id: &str) -> bool {
        self.reap_expired();
        self.services.contains_key(service_id)
    }

    pub fn check_status(&self, check_id: &str) -> Option<HealthStatus> {
        self.reap_expired();
        self.services
            .iter()
            .find(|entry| entry.registration.check.check_id == check_id)
            .map(|entry| entry.status)
    }

    /// Invalidates a session as if its TTL had run out.
    pub fn expire_session(&self, session: &SessionId) {
        let _gate = self.gate();
        self.invalidate_session(session);
    }

    // --- Internals ---

    fn lock_calls(&self) -> MutexGuard<'_, Vec<BackendCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the call, then fails it if a transport failure is pending.
    fn enter(&self, call: BackendCall) -> Result<(), CoordinationError> {
        self.lock_calls().push(call);

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoordinationError::transport("injected transport failure"));
        }

        self.reap_expired();
        Ok(())
    }

    fn bump(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, index: u64) {
        self.index_tx.send_modify(|current| *current = (*current).max(index));
    }

    fn bump_kv(&self) -> u64 {
        let index = self.bump();
        self.kv_table_index.fetch_max(index, Ordering::SeqCst);
        index
    }

    fn bump_service(&self, name: &str) -> u64 {
        let index = self.bump();
        self.catalog_table_index.fetch_max(index, Ordering::SeqCst);
        self.service_indexes.insert(name.to_string(), index);
        index
    }

    fn key_index(&self, key: &str) -> u64 {
        match self.kv.get(key) {
            Some(pair) => pair.modify_index,
            None => self.tombstones.get(key).map(|index| *index).unwrap_or(0),
        }
    }

    fn service_index(&self, name: &str) -> u64 {
        self.service_indexes.get(name).map(|index| *index).unwrap_or(0)
    }

    fn session_valid(&self, session: &SessionId) -> bool {
        self.sessions
            .get(session)
            .map(|entry| entry.last_renewed.elapsed() <= entry.ttl)
            .unwrap_or(false)
    }

    /// Drops the session and releases or deletes every key it locks.
    /// Caller must hold the write gate.
    fn invalidate_session(&self, session: &SessionId) -> bool {
        let Some((_, entry)) = self.sessions.remove(session) else {
            return false;
        };

        let held: Vec<String> = self
            .kv
            .iter()
            .filter(|pair| pair.session.as_ref() == Some(session))
            .map(|pair| pair.key.clone())
            .collect();

        let mut last = 0;
        for key in held {
            let index = self.bump_kv();
            match entry.behavior {
                SessionBehavior::Release => {
                    if let Some(mut pair) = self.kv.get_mut(&key) {
                        pair.session = None;
                        pair.modify_index = index;
                    }
                }
                SessionBehavior::Delete => {
                    self.kv.remove(&key);
                    self.tombstones.insert(key.clone(), index);
                }
            }
            tracing::debug!("Session {} invalidated, {} lock on '{}'", session, entry.behavior.as_str(), key);
            last = index;
        }

        if last > 0 {
            self.publish(last);
        }
        true
    }

    /// Expires sessions past their TTL and applies TTL-check transitions.
    fn reap_expired(&self) {
        let _gate = self.gate();
        let now = Instant::now();

        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| now.duration_since(entry.last_renewed) > entry.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        for session in expired {
            tracing::debug!("Session {} expired", session);
            self.invalidate_session(&session);
        }

        let mut removed = Vec::new();
        for mut entry in self.services.iter_mut() {
            let check_ttl = entry.registration.check.ttl;
            let grace = entry.registration.check.deregister_critical_after;

            if entry.status != HealthStatus::Critical
                && now.duration_since(entry.last_update) > check_ttl
            {
                tracing::debug!("Check {} turned critical", entry.registration.check.check_id);
                entry.status = HealthStatus::Critical;
                entry.critical_since = Some(entry.last_update + check_ttl);
            }

            if let Some(since) = entry.critical_since
                && now.duration_since(since) > grace
            {
                removed.push((entry.key().clone(), entry.registration.name.clone()));
            }
        }

        for (service_id, name) in removed {
            self.services.remove(&service_id);
            let index = self.bump_service(&name);
            self.publish(index);
            tracing::debug!("Service {} removed after staying critical", service_id);
        }
    }

    /// Parks until `current()` moves past `wait_index` or the wait expires.
    async fn wait_for_change(
        &self,
        opts: QueryOptions,
        current: impl Fn(&Self) -> u64,
    ) {
        if !opts.is_blocking() {
            return;
        }

        let mut rx = self.index_tx.subscribe();
        let deadline = Instant::now() + opts.wait_time.unwrap_or(self.default_wait);

        loop {
            self.reap_expired();

            if current(self) != opts.wait_index {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                return;
            }

            let tick = (deadline - now).min(REAP_INTERVAL);
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryBackend {
    async fn kv_get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<(Option<KvPair>, QueryMeta), CoordinationError> {
        self.enter(BackendCall::KvGet {
            key: key.to_string(),
            wait_index: opts.wait_index,
        })?;

        self.wait_for_change(opts, |backend| backend.reported_kv_index(key))
            .await;

        let pair = self.kv.get(key).map(|pair| pair.clone());
        let meta = QueryMeta {
            last_index: self.reported_kv_index(key),
        };

        Ok((pair, meta))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<u64, CoordinationError> {
        self.enter(BackendCall::KvPut {
            key: key.to_string(),
        })?;

        let index = {
            let _gate = self.gate();
            let index = self.bump_kv();
            self.kv
                .entry(key.to_string())
                .and_modify(|pair| {
                    pair.value = value.to_vec();
                    pair.modify_index = index;
                })
                .or_insert_with(|| KvPair {
                    key: key.to_string(),
                    value: value.to_vec(),
                    session: None,
                    create_index: index,
                    modify_index: index,
                    lock_index: 0,
                    flags: 0,
                });
            self.tombstones.remove(key);
            index
        };

        self.publish(index);
        Ok(index)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), CoordinationError> {
        self.enter(BackendCall::KvDelete {
            key: key.to_string(),
        })?;

        let index = {
            let _gate = self.gate();
            if self.kv.remove(key).is_none() {
                return Ok(());
            }
            let index = self.bump_kv();
            self.tombstones.insert(key.to_string(), index);
            index
        };

        self.publish(index);
        Ok(())
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &SessionId,
    ) -> Result<bool, CoordinationError> {
        self.enter(BackendCall::KvAcquire {
            key: key.to_string(),
            session: session.clone(),
        })?;

        let index = {
            let _gate = self.gate();

            if !self.session_valid(session) {
                return Err(CoordinationError::lease_invalid(session.as_str()));
            }

            if let Some(pair) = self.kv.get(key)
                && let Some(holder) = &pair.session
                && holder != session
            {
                return Ok(false);
            }

            let index = self.bump_kv();
            self.kv
                .entry(key.to_string())
                .and_modify(|pair| {
                    if pair.session.as_ref() != Some(session) {
                        pair.lock_index += 1;
                    }
                    pair.value = value.to_vec();
                    pair.session = Some(session.clone());
                    pair.modify_index = index;
                })
                .or_insert_with(|| KvPair {
                    key: key.to_string(),
                    value: value.to_vec(),
                    session: Some(session.clone()),
                    create_index: index,
                    modify_index: index,
                    lock_index: 1,
                    flags: 0,
                });
            self.tombstones.remove(key);
            index
        };

        self.publish(index);
        Ok(true)
    }

    async fn catalog_service(
        &self,
        name: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CoordinationError> {
        self.enter(BackendCall::CatalogService {
            name: name.to_string(),
            wait_index: opts.wait_index,
        })?;

        self.wait_for_change(opts, |backend| backend.reported_service_index(name))
            .await;

        let instances = self
            .services
            .iter()
            .filter(|entry| entry.registration.name == name)
            .map(|entry| CatalogService {
                service_name: entry.registration.name.clone(),
                service_id: entry.registration.id.clone(),
                address: entry.registration.address.clone(),
                port: entry.registration.port,
            })
            .collect();

        let meta = QueryMeta {
            last_index: self.reported_service_index(name),
        };

        Ok((instances, meta))
    }

    async fn session_create(&self, req: &SessionRequest) -> Result<SessionId, CoordinationError> {
        self.enter(BackendCall::SessionCreate)?;

        let id = SessionId::new();
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                ttl: req.ttl,
                behavior: req.behavior,
                last_renewed: Instant::now(),
            },
        );

        Ok(id)
    }

    async fn session_renew(&self, session: &SessionId) -> Result<(), CoordinationError> {
        self.enter(BackendCall::SessionRenew(session.clone()))?;

        let _gate = self.gate();
        match self.sessions.get_mut(session) {
            Some(mut entry) => {
                entry.last_renewed = Instant::now();
                Ok(())
            }
            None => Err(CoordinationError::lease_invalid(session.as_str())),
        }
    }

    async fn session_destroy(&self, session: &SessionId) -> Result<(), CoordinationError> {
        self.enter(BackendCall::SessionDestroy(session.clone()))?;

        let _gate = self.gate();
        self.invalidate_session(session);
        Ok(())
    }

    async fn agent_service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), CoordinationError> {
        self.enter(BackendCall::ServiceRegister(registration.id.clone()))?;

        let index = {
            let _gate = self.gate();
            self.services.insert(
                registration.id.clone(),
                ServiceEntry {
                    registration: registration.clone(),
                    // TTL checks start critical until the first update arrives
                    status: HealthStatus::Critical,
                    last_update: Instant::now(),
                    critical_since: Some(Instant::now()),
                },
            );
            self.bump_service(&registration.name)
        };

        self.publish(index);
        Ok(())
    }

    async fn agent_check_update(
        &self,
        check_id: &str,
        status: HealthStatus,
    ) -> Result<(), CoordinationError> {
        self.enter(BackendCall::CheckUpdate(check_id.to_string()))?;

        let _gate = self.gate();
        let mut entry = self
            .services
            .iter_mut()
            .find(|entry| entry.registration.check.check_id == check_id)
            .ok_or_else(|| CoordinationError::lease_invalid(check_id))?;

        let now = Instant::now();
        entry.status = status;
        entry.last_update = now;
        entry.critical_since = match status {
            HealthStatus::Critical => Some(now),
            _ => None,
        };

        Ok(())
    }

    async fn agent_service_deregister(&self, service_id: &str) -> Result<(), CoordinationError> {
        self.enter(BackendCall::ServiceDeregister(service_id.to_string()))?;

        let index = {
            let _gate = self.gate();
            match self.services.remove(service_id) {
                Some((_, entry)) => self.bump_service(&entry.registration.name),
                None => return Ok(()),
            }
        };

        self.publish(index);
        Ok(())
    }
}

impl InMemoryBackend {
    /// Index reported for a key: its own index, or the table index when it never existed.
    fn reported_kv_index(&self, key: &str) -> u64 {
        match self.key_index(key) {
            0 => self.kv_table_index.load(Ordering::SeqCst),
            index => index,
        }
    }

    fn reported_service_index(&self, name: &str) -> u64 {
        match self.service_index(name) {
            0 => self.catalog_table_index.load(Ordering::SeqCst),
            index => index,
        }
    }
}
