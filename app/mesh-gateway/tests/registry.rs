//! Registry behaviour against scripted backends, on tokio's paused clock

use mesh_gateway::client::{MockBehavior, MockHttpClient};
use mesh_gateway::config::{LoadBalancingStrategy, RegistryConfig};
use mesh_gateway::{
    InstanceStatus, ServiceAvailability, ServiceRegistration, ServiceRegistry,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_secs(30);

fn registry(client: Arc<MockHttpClient>, strategy: LoadBalancingStrategy) -> Arc<ServiceRegistry> {
    let mut config = RegistryConfig::default();
    config.load_balancing = strategy;
    Arc::new(ServiceRegistry::new(config, client).unwrap())
}

/// Let the first probe round of freshly registered instances run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn status(registry: &ServiceRegistry, id: &str) -> InstanceStatus {
    registry.get_instance(id).await.unwrap().status
}

#[tokio::test(start_paused = true)]
async fn health_hysteresis() {
    let client = Arc::new(MockHttpClient::new());
    client.respond("http://10.0.0.1:8000/health", 200, Value::Null);
    let registry = registry(client.clone(), LoadBalancingStrategy::RoundRobin);

    let id = registry
        .register_service(
            ServiceRegistration::new("svc", "1.0.0", "10.0.0.1", 8000)
                .with_health_check_url("http://10.0.0.1:8000/health"),
        )
        .await
        .unwrap();
    assert_eq!(status(&registry, &id).await, InstanceStatus::Starting);

    // one success is below the healthy threshold
    settle().await;
    assert_eq!(status(&registry, &id).await, InstanceStatus::Starting);

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(status(&registry, &id).await, InstanceStatus::Healthy);

    client.on(
        "http://10.0.0.1:8000/health",
        MockBehavior::Fail("connection reset".to_string()),
    );

    // a single failure does not flip a healthy instance
    tokio::time::sleep(INTERVAL).await;
    assert_eq!(status(&registry, &id).await, InstanceStatus::Healthy);
    tokio::time::sleep(INTERVAL).await;
    assert_eq!(status(&registry, &id).await, InstanceStatus::Healthy);

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(status(&registry, &id).await, InstanceStatus::Unhealthy);

    registry.close().await;
}

#[tokio::test(start_paused = true)]
async fn healthy_and_failing_instances() {
    let client = Arc::new(MockHttpClient::new());
    client.respond("http://10.0.0.1:8000/health", 200, Value::Null);
    client.respond("http://10.0.0.2:8000/health", 500, Value::Null);
    let registry = registry(client.clone(), LoadBalancingStrategy::RoundRobin);

    let a = registry
        .register_service(
            ServiceRegistration::new("svc", "1.0.0", "10.0.0.1", 8000)
                .with_health_check_url("http://10.0.0.1:8000/health"),
        )
        .await
        .unwrap();
    let b = registry
        .register_service(
            ServiceRegistration::new("svc", "1.0.0", "10.0.0.2", 8000)
                .with_health_check_url("http://10.0.0.2:8000/health"),
        )
        .await
        .unwrap();

    // three rounds: t=0, t=30s, t=60s
    settle().await;
    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(client.call_count("http://10.0.0.2:8000/health").await, 3);

    let health = registry.get_service_health("svc").await;
    assert_eq!(health.healthy_instances, 1);
    assert_eq!(health.unhealthy_instances, 1);
    assert_eq!(health.total_instances, 2);
    assert_eq!(health.status, ServiceAvailability::Degraded);
    assert_eq!(status(&registry, &b).await, InstanceStatus::Unhealthy);

    for _ in 0..10 {
        let chosen = registry.discover_service("svc", None).await.unwrap();
        assert_eq!(chosen.id, a);
    }

    registry.close().await;
}

#[tokio::test(start_paused = true)]
async fn deregistration_stops_probing() {
    let client = Arc::new(MockHttpClient::new());
    client.respond("http://10.0.0.1:8000/health", 200, Value::Null);
    let registry = registry(client.clone(), LoadBalancingStrategy::RoundRobin);

    let id = registry
        .register_service(
            ServiceRegistration::new("svc", "1.0.0", "10.0.0.1", 8000)
                .with_health_check_url("http://10.0.0.1:8000/health"),
        )
        .await
        .unwrap();
    settle().await;
    assert!(registry.has_health_check(&id).await);

    assert!(registry.deregister_service(&id).await);
    assert!(!registry.has_health_check(&id).await);

    let probes = client.call_count("http://10.0.0.1:8000/health").await;
    tokio::time::sleep(INTERVAL * 4).await;
    assert_eq!(client.call_count("http://10.0.0.1:8000/health").await, probes);
    assert!(registry.discover_service("svc", None).await.is_none());
}

#[tokio::test]
async fn round_robin_fairness() {
    let registry = registry(Arc::new(MockHttpClient::new()), LoadBalancingStrategy::RoundRobin);

    let mut ids = HashSet::new();
    for port in 9001..=9004 {
        ids.insert(
            registry
                .register_service(ServiceRegistration::new("svc", "1.0.0", "10.0.0.1", port))
                .await
                .unwrap(),
        );
    }

    for _ in 0..3 {
        let mut seen = HashSet::new();
        for _ in 0..ids.len() {
            seen.insert(registry.discover_service("svc", None).await.unwrap().id);
        }
        assert_eq!(seen, ids);
    }
}

#[tokio::test]
async fn least_connections_follows_in_flight_calls() {
    let registry = registry(
        Arc::new(MockHttpClient::new()),
        LoadBalancingStrategy::LeastConnections,
    );
    let first = registry
        .register_service(ServiceRegistration::new("svc", "1.0.0", "10.0.0.1", 9001))
        .await
        .unwrap();
    let second = registry
        .register_service(ServiceRegistration::new("svc", "1.0.0", "10.0.0.2", 9001))
        .await
        .unwrap();

    let busy = registry.acquire_connection(&first);
    assert_eq!(registry.active_connections(&first), 1);
    assert_eq!(registry.discover_service("svc", None).await.unwrap().id, second);

    drop(busy);
    assert_eq!(registry.active_connections(&first), 0);
    assert_eq!(registry.discover_service("svc", None).await.unwrap().id, first);
}
