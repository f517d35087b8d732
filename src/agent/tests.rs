//! Agent Module Tests
//!
//! ## Test Scopes
//! - **Identity**: unique registration ids and their check ids.
//! - **Heartbeat**: cadence, transient failures, unknown checks.
//! - **Registrar**: registration, ordered shutdown, removal after missed heartbeats.
//! - **Listener**: the service's own HTTP endpoint.

#[cfg(test)]
mod tests {
    use crate::agent::heartbeat::HeartbeatPublisher;
    use crate::agent::listener::{self, ServiceInfo};
    use crate::agent::registrar::ServiceRegistrar;
    use crate::agent::types::{RegistrationId, RegistrationState, ServiceRegistration};
    use crate::backend::memory::{BackendCall, InMemoryBackend};
    use crate::backend::{HealthStatus, QueryOptions, SharedBackend};
    use crate::config::CoordinatorConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Arc<InMemoryBackend>, SharedBackend) {
        let backend = Arc::new(InMemoryBackend::new());
        let shared: SharedBackend = backend.clone();
        (backend, shared)
    }

    fn api_config() -> CoordinatorConfig {
        CoordinatorConfig {
            service_ttl: Duration::from_secs(5),
            deregister_after: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(1),
            ..CoordinatorConfig::default()
        }
    }

    // ============================================================
    // IDENTITY TESTS
    // ============================================================

    #[test]
    fn test_registration_ids_are_unique_and_prefixed() {
        let a = RegistrationId::generate("api");
        let b = RegistrationId::generate("api");

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("api-"));
        assert_eq!(a.check_id(), format!("service:{}", a));
    }

    #[test]
    fn test_registration_maps_to_agent_payload() {
        let registration = ServiceRegistration::new(
            "api",
            "127.0.0.1",
            41000,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );

        let agent = registration.to_agent();

        assert_eq!(agent.id, registration.id.as_str());
        assert_eq!(agent.name, "api");
        assert_eq!(agent.port, 41000);
        assert_eq!(agent.check.check_id, registration.check_id);
        assert_eq!(agent.check.ttl, Duration::from_secs(5));
        assert_eq!(agent.check.deregister_critical_after, Duration::from_secs(60));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RegistrationState::Healthy.is_terminal());
        assert!(RegistrationState::Deregistered.is_terminal());
        assert!(RegistrationState::ExpiredRemoved.is_terminal());
    }

    // ============================================================
    // HEARTBEAT TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reports_passing_every_interval() {
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared.clone(), &api_config());
        let registration = registrar
            .register("api", "127.0.0.1", 41000, Duration::from_secs(5), Duration::from_secs(60))
            .await
            .unwrap();
        let root = CancellationToken::new();

        let heartbeat = registrar
            .start_heartbeat(&registration, Duration::from_secs(1), &root)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(backend.check_update_count(&registration.check_id), 3);
        assert_eq!(
            backend.check_status(&registration.check_id),
            Some(HealthStatus::Passing)
        );
        assert!(heartbeat.stop().await.is_cancelled());
    }

    #[tokio::test]
    async fn test_heartbeat_interval_must_fit_in_ttl() {
        let (_backend, shared) = setup();
        let registrar = ServiceRegistrar::new(shared);
        let registration = registrar
            .register("api", "127.0.0.1", 41000, Duration::from_secs(5), Duration::from_secs(60))
            .await
            .unwrap();

        let result = registrar.start_heartbeat(
            &registration,
            Duration::from_secs(3),
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(e) if e.is_configuration()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_for_unknown_check_is_invalidated() {
        let (_backend, shared) = setup();
        let publisher = HeartbeatPublisher::new(shared);

        let outcome = publisher
            .run("service:ghost", Duration::from_secs(1), CancellationToken::new())
            .await;

        assert!(outcome.is_invalidated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_heartbeats_do_not_stop_the_loop() {
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared, &api_config());
        let root = CancellationToken::new();
        let service = registrar.run("api", "127.0.0.1", 41000, &root).await.unwrap();

        backend.fail_next(2);
        tokio::time::sleep(Duration::from_millis(4_500)).await;

        assert!(service.is_heartbeating());
        assert_eq!(
            backend.check_status(&service.registration().check_id),
            Some(HealthStatus::Passing)
        );
        assert_eq!(service.shutdown().await.unwrap(), RegistrationState::Deregistered);
    }

    // ============================================================
    // REGISTRAR TESTS
    // ============================================================

    #[tokio::test]
    async fn test_register_rejects_empty_name() {
        let (_backend, shared) = setup();
        let registrar = ServiceRegistrar::new(shared);

        let err = registrar
            .register("", "127.0.0.1", 41000, Duration::from_secs(5), Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(err.is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_registers_healthy_instance() {
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared.clone(), &api_config());
        let root = CancellationToken::new();

        let service = registrar.run("api", "127.0.0.1", 41000, &root).await.unwrap();

        assert!(backend.service_registered(service.id().as_str()));
        assert_eq!(
            backend.check_status(&service.registration().check_id),
            Some(HealthStatus::Passing),
            "the first heartbeat is sent before run returns"
        );

        let (instances, _) = shared
            .catalog_service("api", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].address, "127.0.0.1");
        assert_eq!(instances[0].port, 41000);

        service.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_heartbeat_before_deregister() {
        // ARRANGE
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared, &api_config());
        let root = CancellationToken::new();
        let service = registrar.run("api", "127.0.0.1", 41000, &root).await.unwrap();
        let id = service.id().clone();
        let check_id = service.registration().check_id.clone();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        // ACT
        let state = service.shutdown().await.unwrap();
        let updates_at_shutdown = backend.check_update_count(&check_id);
        tokio::time::sleep(Duration::from_secs(5)).await;

        // ASSERT
        assert_eq!(state, RegistrationState::Deregistered);
        assert!(!backend.service_registered(id.as_str()));
        assert_eq!(backend.check_update_count(&check_id), updates_at_shutdown);

        let calls = backend.calls();
        let deregister_at = calls
            .iter()
            .position(|c| *c == BackendCall::ServiceDeregister(id.to_string()))
            .expect("service must be deregistered");
        let last_update_at = calls
            .iter()
            .rposition(|c| *c == BackendCall::CheckUpdate(check_id.clone()))
            .expect("service must have heartbeated");
        assert!(last_update_at < deregister_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_remove_service_after_grace() {
        // ARRANGE: "api" at 127.0.0.1:41000, TTL 5s, removed 60s after turning critical
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared.clone(), &api_config());
        let root = CancellationToken::new();
        let service = registrar.run("api", "127.0.0.1", 41000, &root).await.unwrap();
        let id = service.id().clone();

        // ACT: every heartbeat from now on is lost
        backend.fail_next(usize::MAX);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let during_grace = backend.service_registered(id.as_str());
        tokio::time::sleep(Duration::from_secs(40)).await;
        let after_grace = backend.service_registered(id.as_str());

        // ASSERT
        assert!(during_grace, "critical but still inside the grace window");
        assert!(!after_grace, "removed once critical past the grace window");

        // Heartbeats get through again and find the check gone.
        backend.fail_next(0);
        let err = tokio::time::timeout(Duration::from_secs(5), service.expired())
            .await
            .expect("expiry must be reported by the next heartbeat");
        assert!(err.is_lease_invalid());
        assert!(service.is_expired());
        assert!(!service.is_heartbeating());

        assert_eq!(service.shutdown().await.unwrap(), RegistrationState::ExpiredRemoved);
        assert_eq!(
            backend.count_calls(|c| matches!(c, BackendCall::ServiceDeregister(_))),
            0,
            "an expired registration is not deregistered again"
        );

        let (instances, _) = shared
            .catalog_service("api", QueryOptions::default())
            .await
            .unwrap();
        assert!(instances.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_cancellation_stops_heartbeat_then_shutdown_deregisters() {
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared, &api_config());
        let root = CancellationToken::new();
        let service = registrar.run("api", "127.0.0.1", 41000, &root).await.unwrap();
        let id = service.id().clone();

        root.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!service.is_heartbeating());
        assert!(!service.is_expired(), "cancellation is not an expiry");
        assert!(backend.service_registered(id.as_str()));

        assert_eq!(service.shutdown().await.unwrap(), RegistrationState::Deregistered);
        assert!(!backend.service_registered(id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_returns_when_the_agent_drops_the_instance() {
        // ARRANGE
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared.clone(), &api_config());
        let root = CancellationToken::new();
        let service = registrar.run("api", "127.0.0.1", 41000, &root).await.unwrap();
        let id = service.id().clone();

        // ACT: the agent forgets the instance behind our back
        shared.agent_service_deregister(id.as_str()).await.unwrap();
        let state = tokio::time::timeout(Duration::from_secs(5), service.run_until(&root))
            .await
            .expect("the lost registration must end the run")
            .unwrap();

        // ASSERT
        assert_eq!(state, RegistrationState::ExpiredRemoved);
        assert!(!root.is_cancelled());
        assert_eq!(
            backend.count_calls(|c| matches!(c, BackendCall::ServiceDeregister(_))),
            1,
            "only the agent's own removal"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_deregisters_on_cancel() {
        let (backend, shared) = setup();
        let registrar = ServiceRegistrar::from_config(shared, &api_config());
        let root = CancellationToken::new();
        let service = registrar.run("api", "127.0.0.1", 41000, &root).await.unwrap();
        let id = service.id().clone();

        let canceller = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });
        let state = service.run_until(&root).await.unwrap();

        assert_eq!(state, RegistrationState::Deregistered);
        assert!(!backend.service_registered(id.as_str()));
    }

    // ============================================================
    // LISTENER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_listener_serves_info_and_health() {
        let (listener, addr) = listener::bind_local().await.unwrap();
        assert_ne!(addr.port(), 0);

        let info = ServiceInfo {
            service: "api".to_string(),
            address: addr.ip().to_string(),
            port: addr.port(),
        };
        let cancel = CancellationToken::new();
        let server = tokio::spawn(listener::serve(listener, info, cancel.clone()));

        let client = reqwest::Client::new();
        let health = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = client
            .get(format!("http://{}/", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(health.status(), reqwest::StatusCode::OK);
        assert_eq!(body["service"], "api");
        assert_eq!(body["port"], addr.port());

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
