//! Watch Module Tests
//!
//! Exercises the blocking watcher against the in-memory backend and against a
//! scripted backend for server behavior the in-memory model never produces
//! (index regression, an index that moves on every read).
//!
//! ## Test Scopes
//! - **Cursor**: first read with index 0, hand-off of the returned index, regression.
//! - **Errors**: a failed read is reported and retried with the same cursor.
//! - **Churn**: consecutive reads are spaced by the minimum poll interval.
//! - **Services**: instance ordering, empty instance lists, deregistration.

#[cfg(test)]
mod tests {
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::{
        AgentServiceCheck, AgentServiceRegistration, CatalogService, CoordinationBackend,
        CoordinationError, HealthStatus, KvPair, QueryMeta, QueryOptions, SessionId,
        SessionRequest, SharedBackend,
    };
    use crate::watch::types::{
        CursorMove, IndexCursor, ObservedValue, WatchEvent, WatchOptions, WatchTarget,
    };
    use crate::watch::watcher::{BlockingWatcher, ChannelWatchHandler, FnWatchHandler};

    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    type KvResult = Result<(Option<KvPair>, QueryMeta), CoordinationError>;

    /// What the scripted backend does once its script is used up.
    enum WhenEmpty {
        /// Block forever, like a long poll on an idle key.
        Pend,
        /// Answer immediately with an index one higher than the last.
        Churn,
    }

    /// Answers `kv_get` from a script and records every read.
    struct ScriptedBackend {
        script: Mutex<VecDeque<KvResult>>,
        when_empty: WhenEmpty,
        churn_index: AtomicU64,
        reads: Mutex<Vec<(u64, Instant)>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<KvResult>, when_empty: WhenEmpty) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                when_empty,
                churn_index: AtomicU64::new(0),
                reads: Mutex::new(Vec::new()),
            })
        }

        fn wait_indexes(&self) -> Vec<u64> {
            self.reads.lock().unwrap().iter().map(|(index, _)| *index).collect()
        }

        fn read_times(&self) -> Vec<Instant> {
            self.reads.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }
    }

    fn unscripted<T>() -> Result<T, CoordinationError> {
        Err(CoordinationError::backend(501, "not scripted"))
    }

    #[async_trait]
    impl CoordinationBackend for ScriptedBackend {
        async fn kv_get(&self, _key: &str, opts: QueryOptions) -> KvResult {
            self.reads.lock().unwrap().push((opts.wait_index, Instant::now()));

            let next = self.script.lock().unwrap().pop_front();
            match (next, &self.when_empty) {
                (Some(result), _) => result,
                (None, WhenEmpty::Pend) => std::future::pending().await,
                (None, WhenEmpty::Churn) => {
                    let index = self.churn_index.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((None, QueryMeta { last_index: index }))
                }
            }
        }

        async fn kv_put(&self, _key: &str, _value: &[u8]) -> Result<u64, CoordinationError> {
            unscripted()
        }

        async fn kv_delete(&self, _key: &str) -> Result<(), CoordinationError> {
            unscripted()
        }

        async fn kv_acquire(
            &self,
            _key: &str,
            _value: &[u8],
            _session: &SessionId,
        ) -> Result<bool, CoordinationError> {
            unscripted()
        }

        async fn catalog_service(
            &self,
            _name: &str,
            _opts: QueryOptions,
        ) -> Result<(Vec<CatalogService>, QueryMeta), CoordinationError> {
            unscripted()
        }

        async fn session_create(&self, _req: &SessionRequest) -> Result<SessionId, CoordinationError> {
            unscripted()
        }

        async fn session_renew(&self, _session: &SessionId) -> Result<(), CoordinationError> {
            unscripted()
        }

        async fn session_destroy(&self, _session: &SessionId) -> Result<(), CoordinationError> {
            unscripted()
        }

        async fn agent_service_register(
            &self,
            _registration: &AgentServiceRegistration,
        ) -> Result<(), CoordinationError> {
            unscripted()
        }

        async fn agent_check_update(
            &self,
            _check_id: &str,
            _status: HealthStatus,
        ) -> Result<(), CoordinationError> {
            unscripted()
        }

        async fn agent_service_deregister(&self, _service_id: &str) -> Result<(), CoordinationError> {
            unscripted()
        }
    }

    fn memory() -> (Arc<InMemoryBackend>, SharedBackend) {
        let backend = Arc::new(InMemoryBackend::new());
        let shared: SharedBackend = backend.clone();
        (backend, shared)
    }

    fn pair(key: &str, value: &str, index: u64) -> KvPair {
        KvPair {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            session: None,
            create_index: index,
            modify_index: index,
            lock_index: 0,
            flags: 0,
        }
    }

    fn registration(id: &str, name: &str, address: &str, port: u16) -> AgentServiceRegistration {
        AgentServiceRegistration {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            port,
            check: AgentServiceCheck {
                check_id: format!("service:{}", id),
                ttl: Duration::from_secs(5),
                deregister_critical_after: Duration::from_secs(60),
            },
        }
    }

    fn key_watcher(backend: SharedBackend, key: &str) -> BlockingWatcher {
        BlockingWatcher::new(backend, WatchTarget::Key(key.to_string()), WatchOptions::default())
    }

    // ============================================================
    // INDEX CURSOR TESTS
    // ============================================================

    #[test]
    fn test_cursor_starts_without_baseline() {
        assert_eq!(IndexCursor::new().wait_index(), 0);
    }

    #[test]
    fn test_cursor_reports_moves() {
        let mut cursor = IndexCursor::new();

        assert_eq!(cursor.advance(12), CursorMove::Advanced);
        assert_eq!(cursor.advance(12), CursorMove::Unchanged);
        assert_eq!(cursor.advance(3), CursorMove::Regressed { from: 12 });
        assert_eq!(cursor.wait_index(), 3, "a lower index becomes the new baseline");
    }

    // ============================================================
    // EVENT RENDERING TESTS
    // ============================================================

    #[test]
    fn test_key_event_display() {
        let found = WatchEvent {
            target: WatchTarget::Key("config/mode".to_string()),
            value: ObservedValue::Key(Some(pair("config/mode", "blue", 7))),
            index: 7,
        };
        let missing = WatchEvent {
            target: WatchTarget::Key("config/mode".to_string()),
            value: ObservedValue::Key(None),
            index: 9,
        };

        assert_eq!(found.to_string(), "LastIndex: 7, 'config/mode' key value is 'blue'");
        assert_eq!(missing.to_string(), "LastIndex: 9, key 'config/mode' not found");
        assert!(missing.value.is_absent());
    }

    // ============================================================
    // KEY WATCH TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_of_empty_key_returns_immediately() {
        let (_backend, shared) = memory();
        let watcher = key_watcher(shared, "missing");

        let started = Instant::now();
        let event = watcher.poll_once(0).await.unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(event.value.is_absent());
        assert_eq!(event.index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_wakes_blocked_watcher() {
        // ARRANGE
        let (backend, shared) = memory();
        let n = shared.kv_put("k", b"v1").await.unwrap();

        let (handler, mut events) = ChannelWatchHandler::new();
        let cancel = CancellationToken::new();
        let task = key_watcher(shared.clone(), "k").spawn(handler, cancel.clone());

        let first = events.recv().await.unwrap();
        assert_eq!(first.value.as_key().map(|p| p.value_str()), Some("v1".to_string()));
        assert_eq!(first.index, n);

        // ACT
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.kv_wait_indexes("k"), vec![0, n], "watcher must be parked at n");
        shared.kv_put("k", b"v2").await.unwrap();

        // ASSERT
        let second = events.recv().await.unwrap();
        assert_eq!(second.value.as_key().map(|p| p.value_str()), Some("v2".to_string()));
        assert_eq!(second.index, n + 1);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), n + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_read_uses_previous_index() {
        let (backend, shared) = memory();
        shared.kv_put("k", b"init").await.unwrap();
        let (handler, mut events) = ChannelWatchHandler::new();
        let cancel = CancellationToken::new();
        let task = key_watcher(shared.clone(), "k").spawn(handler, cancel.clone());

        let mut seen = vec![events.recv().await.unwrap().index];
        for value in ["a", "b", "c"] {
            tokio::time::sleep(Duration::from_millis(500)).await;
            shared.kv_put("k", value.as_bytes()).await.unwrap();
            seen.push(events.recv().await.unwrap().index);
        }

        cancel.cancel();
        task.await.unwrap();

        let wait_indexes = backend.kv_wait_indexes("k");
        assert_eq!(wait_indexes[0], 0);
        for (i, index) in seen.iter().enumerate() {
            if let Some(next) = wait_indexes.get(i + 1) {
                assert_eq!(next, index, "read {} must wait on the index of event {}", i + 1, i);
            }
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_key_is_reported_absent() {
        let (_backend, shared) = memory();
        shared.kv_put("k", b"v").await.unwrap();

        let (handler, mut events) = ChannelWatchHandler::new();
        let cancel = CancellationToken::new();
        let task = key_watcher(shared.clone(), "k").spawn(handler, cancel.clone());
        let first = events.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        shared.kv_delete("k").await.unwrap();
        let second = events.recv().await.unwrap();

        assert!(!first.value.is_absent());
        assert!(second.value.is_absent());
        assert!(second.index > first.index);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_keeps_cursor_and_backs_off() {
        // ARRANGE
        let (backend, shared) = memory();
        let n = shared.kv_put("k", b"v1").await.unwrap();
        backend.fail_next(1);

        let errors = Arc::new(AtomicUsize::new(0));
        let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
        let error_count = errors.clone();
        let handler = FnWatchHandler::new(
            move |event: &WatchEvent| {
                let _ = tx.send((event.clone(), Instant::now()));
            },
            move |_: &CoordinationError| {
                error_count.fetch_add(1, Ordering::SeqCst);
            },
        );
        let cancel = CancellationToken::new();
        let started = Instant::now();

        // ACT
        let task = key_watcher(shared, "k").spawn(handler, cancel.clone());
        let (event, at) = events.recv().await.unwrap();

        // ASSERT
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(event.index, n);
        assert!(at.duration_since(started) >= Duration::from_secs(1), "retry waits the backoff");
        assert_eq!(&backend.kv_wait_indexes("k")[..2], &[0, 0], "retry reuses the same cursor");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_regression_becomes_new_baseline() {
        let backend = ScriptedBackend::new(
            vec![
                Ok((Some(pair("k", "v", 10)), QueryMeta { last_index: 10 })),
                Ok((Some(pair("k", "v", 5)), QueryMeta { last_index: 5 })),
            ],
            WhenEmpty::Pend,
        );
        let (handler, mut events) = ChannelWatchHandler::new();
        let cancel = CancellationToken::new();
        let task = key_watcher(backend.clone(), "k").spawn(handler, cancel.clone());

        assert_eq!(events.recv().await.unwrap().index, 10);
        assert_eq!(events.recv().await.unwrap().index, 5);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(backend.wait_indexes(), vec![0, 10, 5]);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_churning_index_is_rate_limited() {
        // ARRANGE
        let backend = ScriptedBackend::new(Vec::new(), WhenEmpty::Churn);
        let (handler, _events) = ChannelWatchHandler::new();
        let cancel = CancellationToken::new();
        let options = WatchOptions::default();

        // ACT
        let task = BlockingWatcher::new(backend.clone(), WatchTarget::Key("k".to_string()), options)
            .spawn(handler, cancel.clone());
        tokio::time::sleep(Duration::from_millis(2_050)).await;
        cancel.cancel();
        task.await.unwrap();

        // ASSERT
        let times = backend.read_times();
        assert_eq!(times.len(), 11, "one read at start, then one every 200ms");
        for pair in times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= options.min_poll_interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_blocked_read() {
        let (_backend, shared) = memory();
        shared.kv_put("k", b"v").await.unwrap();

        let (handler, mut events) = ChannelWatchHandler::new();
        let cancel = CancellationToken::new();
        let task = key_watcher(shared, "k").spawn(handler, cancel.clone());
        events.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let cancelled_at = Instant::now();
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(cancelled_at.elapsed(), Duration::ZERO);
    }

    // ============================================================
    // SERVICE WATCH TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_service_instances_are_sorted() {
        let (_backend, shared) = memory();
        for (id, address, port) in [
            ("web-3", "10.0.0.2", 80),
            ("web-2", "10.0.0.1", 8080),
            ("web-1", "10.0.0.1", 80),
        ] {
            shared
                .agent_service_register(&registration(id, "web", address, port))
                .await
                .unwrap();
        }
        shared
            .agent_service_register(&registration("db-1", "db", "10.0.0.9", 5432))
            .await
            .unwrap();

        let watcher = BlockingWatcher::new(
            shared,
            WatchTarget::Service("web".to_string()),
            WatchOptions::default(),
        );
        let event = watcher.poll_once(0).await.unwrap();

        assert_eq!(event.value.instances().len(), 3);
        assert_eq!(
            event.to_string(),
            format!("LastIndex: {}, instances: 10.0.0.1:80,10.0.0.1:8080,10.0.0.2:80", event.index)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_service_is_empty_not_error() {
        let (_backend, shared) = memory();
        let watcher = BlockingWatcher::new(
            shared,
            WatchTarget::Service("ghost".to_string()),
            WatchOptions::default(),
        );

        let event = watcher.poll_once(0).await.unwrap();

        assert!(event.value.is_absent());
        assert_eq!(event.to_string(), "LastIndex: 0, service 'ghost' not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_watch_sees_deregistration() {
        let (_backend, shared) = memory();
        shared
            .agent_service_register(&registration("api-1", "api", "127.0.0.1", 41000))
            .await
            .unwrap();

        let (handler, mut events) = ChannelWatchHandler::new();
        let cancel = CancellationToken::new();
        let task = BlockingWatcher::new(
            shared.clone(),
            WatchTarget::Service("api".to_string()),
            WatchOptions::default(),
        )
        .spawn(handler, cancel.clone());

        let first = events.recv().await.unwrap();
        assert_eq!(first.value.instances().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        shared.agent_service_deregister("api-1").await.unwrap();
        let second = events.recv().await.unwrap();

        assert!(second.value.is_absent());
        assert!(second.index > first.index);

        cancel.cancel();
        task.await.unwrap();
    }
}
