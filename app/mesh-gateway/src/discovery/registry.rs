//! Service registry implementation

use crate::{
    client::HttpClient,
    config::RegistryConfig,
    discovery::health::HealthCheckHandle,
    error::GatewayError,
    load_balancer::{ConnectionGuard, LoadBalancer},
    types::{
        current_timestamp_ms, DiscoveryOptions, InstanceStatus, RegistryStats,
        ServiceAvailability, ServiceGroupStats, ServiceHealth, ServiceInstance,
        ServiceRegistration,
    },
    GatewayResult,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default instance weight when a registration does not set one
pub const DEFAULT_INSTANCE_WEIGHT: u32 = 100;

type InstanceCell = Arc<RwLock<ServiceInstance>>;

/// Registry of live service instances
pub struct ServiceRegistry {
    config: RegistryConfig,
    client: Arc<dyn HttpClient>,

    /// Service groups keyed by name, instances in registration order
    services: RwLock<HashMap<String, Vec<InstanceCell>>>,

    /// Probe tasks keyed by instance id
    health_checks: Mutex<HashMap<String, HealthCheckHandle>>,

    load_balancer: LoadBalancer,

    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    /// Create a new registry
    pub fn new(config: RegistryConfig, client: Arc<dyn HttpClient>) -> GatewayResult<Self> {
        config.validate()?;

        Ok(Self {
            load_balancer: LoadBalancer::new(config.load_balancing),
            config,
            client,
            services: RwLock::new(HashMap::new()),
            health_checks: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Start the expired-instance reaper
    pub async fn start(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().await;
        if reaper.is_some() {
            return;
        }

        let registry = Arc::downgrade(self);
        let interval = self.config.cleanup_interval;
        *reaper = Some(tokio::spawn(run_reaper(registry, interval)));

        info!(
            "Service registry started (reaper every {:?}, heartbeat timeout {:?})",
            interval, self.config.heartbeat_timeout
        );
    }

    /// Stop every health check and the reaper
    pub async fn close(&self) {
        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.abort();
        }

        let mut health_checks = self.health_checks.lock().await;
        for (_, handle) in health_checks.drain() {
            handle.stop();
        }

        info!("Service registry closed");
    }

    /// Register an instance and return its generated id
    pub async fn register_service(&self, registration: ServiceRegistration) -> GatewayResult<String> {
        if registration.name.is_empty() || registration.host.is_empty() {
            return Err(GatewayError::ServiceDiscovery(
                "Registration requires a service name and host".to_string(),
            ));
        }

        let now = current_timestamp_ms();
        let id = format!("{}_{}", registration.name, uuid::Uuid::new_v4().simple());
        let status = if registration.health_check_url.is_some() {
            InstanceStatus::Starting
        } else {
            // nothing to probe
            InstanceStatus::Healthy
        };

        let instance = ServiceInstance {
            id: id.clone(),
            name: registration.name.clone(),
            version: registration.version,
            host: registration.host,
            port: registration.port,
            protocol: registration.protocol,
            health_check_url: registration.health_check_url.clone(),
            status,
            tags: registration.tags,
            weight: registration.weight.unwrap_or(DEFAULT_INSTANCE_WEIGHT),
            registered_at: now,
            last_heartbeat: now,
            metadata: registration.metadata,
        };
        let cell = Arc::new(RwLock::new(instance));

        self.services
            .write()
            .await
            .entry(registration.name.clone())
            .or_default()
            .push(cell.clone());

        if let Some(url) = registration.health_check_url {
            let handle = HealthCheckHandle::spawn(
                cell,
                url,
                self.client.clone(),
                self.config.health_check.clone(),
            );
            self.health_checks.lock().await.insert(id.clone(), handle);
        }

        info!("Registered instance {} of service {}", id, registration.name);
        Ok(id)
    }

    /// Remove an instance; false if it is not registered
    pub async fn deregister_service(&self, instance_id: &str) -> bool {
        let removed = {
            let mut services = self.services.write().await;
            let mut removed = None;

            for (name, instances) in services.iter_mut() {
                if let Some(pos) = position_of(instances, instance_id).await {
                    removed = Some((name.clone(), instances.remove(pos), instances.is_empty()));
                    break;
                }
            }

            if let Some((name, _, true)) = &removed {
                services.remove(name);
            }
            removed
        };

        let Some((name, cell, group_empty)) = removed else {
            debug!("Deregister ignored, unknown instance {}", instance_id);
            return false;
        };

        cell.write().await.status = InstanceStatus::Stopping;
        self.stop_health_check(instance_id).await;
        self.load_balancer.forget_instance(instance_id);
        if group_empty {
            self.load_balancer.forget_service(&name);
        }

        info!("Deregistered instance {} of service {}", instance_id, name);
        true
    }

    /// Pick a healthy instance of `service_name` that matches `options`
    pub async fn discover_service(
        &self,
        service_name: &str,
        options: Option<&DiscoveryOptions>,
    ) -> Option<ServiceInstance> {
        let candidates: Vec<ServiceInstance> = self
            .get_service_instances(service_name)
            .await
            .into_iter()
            .filter(|instance| instance.status == InstanceStatus::Healthy)
            .filter(|instance| options.map_or(true, |o| o.matches(instance)))
            .collect();

        if candidates.is_empty() {
            debug!("No healthy instance available for {}", service_name);
            return None;
        }

        self.load_balancer.select(service_name, &candidates)
    }

    /// Track an in-flight call for least-connections balancing
    pub fn acquire_connection(&self, instance_id: &str) -> ConnectionGuard {
        self.load_balancer.acquire(instance_id)
    }

    pub fn active_connections(&self, instance_id: &str) -> usize {
        self.load_balancer.active_connections(instance_id)
    }

    /// Aggregate health of a service group
    pub async fn get_service_health(&self, service_name: &str) -> ServiceHealth {
        let instances = self.get_service_instances(service_name).await;
        let healthy = count_status(&instances, InstanceStatus::Healthy);
        let unhealthy = count_status(&instances, InstanceStatus::Unhealthy);
        let total = instances.len();

        let status = if healthy == 0 {
            ServiceAvailability::Unavailable
        } else if healthy == total {
            ServiceAvailability::Available
        } else {
            ServiceAvailability::Degraded
        };

        ServiceHealth {
            service_name: service_name.to_string(),
            healthy_instances: healthy,
            unhealthy_instances: unhealthy,
            total_instances: total,
            health_ratio: if total > 0 {
                healthy as f64 / total as f64
            } else {
                0.0
            },
            status,
            last_updated: current_timestamp_ms(),
        }
    }

    /// Snapshot of one service group
    pub async fn get_service_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let cells = {
            let services = self.services.read().await;
            services.get(service_name).cloned().unwrap_or_default()
        };

        snapshot(&cells).await
    }

    /// Snapshot of every service group
    pub async fn get_all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        let groups: Vec<(String, Vec<InstanceCell>)> = {
            let services = self.services.read().await;
            services
                .iter()
                .map(|(name, cells)| (name.clone(), cells.clone()))
                .collect()
        };

        let mut result = HashMap::with_capacity(groups.len());
        for (name, cells) in groups {
            result.insert(name, snapshot(&cells).await);
        }
        result
    }

    pub async fn get_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        let cell = self.find_instance(instance_id).await?;
        let instance = cell.read().await.clone();
        Some(instance)
    }

    /// Registry-wide totals plus per-service breakdown
    pub async fn get_service_stats(&self) -> RegistryStats {
        let all = self.get_all_services().await;

        let mut services: Vec<ServiceGroupStats> = all
            .iter()
            .map(|(name, instances)| ServiceGroupStats {
                name: name.clone(),
                instance_count: instances.len(),
                healthy_count: count_status(instances, InstanceStatus::Healthy),
                unhealthy_count: count_status(instances, InstanceStatus::Unhealthy),
                versions: instances
                    .iter()
                    .map(|i| i.version.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect(),
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        RegistryStats {
            total_services: services.len(),
            total_instances: services.iter().map(|s| s.instance_count).sum(),
            healthy_instances: services.iter().map(|s| s.healthy_count).sum(),
            unhealthy_instances: services.iter().map(|s| s.unhealthy_count).sum(),
            services,
        }
    }

    /// Merge `metadata` into an instance's metadata
    pub async fn update_service_metadata(
        &self,
        instance_id: &str,
        metadata: HashMap<String, Value>,
    ) -> bool {
        match self.find_instance(instance_id).await {
            Some(cell) => {
                cell.write().await.metadata.extend(metadata);
                true
            }
            None => false,
        }
    }

    /// Refresh an instance's heartbeat
    pub async fn heartbeat(&self, instance_id: &str) -> bool {
        match self.find_instance(instance_id).await {
            Some(cell) => {
                cell.write().await.last_heartbeat = current_timestamp_ms();
                true
            }
            None => false,
        }
    }

    /// Whether a probe task is running for the instance
    pub async fn has_health_check(&self, instance_id: &str) -> bool {
        self.health_checks
            .lock()
            .await
            .get(instance_id)
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    pub async fn cleanup_expired_instances(&self) -> usize {
        self.cleanup_expired_instances_at(current_timestamp_ms()).await
    }

    /// Remove instances whose last heartbeat is older than the heartbeat
    /// timeout as of `now_ms`; returns how many were removed
    pub async fn cleanup_expired_instances_at(&self, now_ms: u64) -> usize {
        let expire_after = self.config.heartbeat_timeout.as_millis() as u64;
        let mut expired = Vec::new();

        {
            let services = self.services.read().await;
            for (name, cells) in services.iter() {
                for cell in cells {
                    let instance = cell.read().await;
                    if now_ms.saturating_sub(instance.last_heartbeat) > expire_after {
                        expired.push((name.clone(), instance.id.clone()));
                    }
                }
            }
        }

        self.remove_expired(&expired).await
    }

    /// Deregister each `(service, instance)`; an instance already gone is not counted
    async fn remove_expired(&self, expired: &[(String, String)]) -> usize {
        let mut removed = 0;
        for (name, instance_id) in expired {
            if self.deregister_service(instance_id).await {
                warn!("Removed expired instance {} of service {}", instance_id, name);
                removed += 1;
            }
        }
        removed
    }

    async fn stop_health_check(&self, instance_id: &str) {
        if let Some(handle) = self.health_checks.lock().await.remove(instance_id) {
            handle.stop();
        }
    }

    async fn find_instance(&self, instance_id: &str) -> Option<InstanceCell> {
        let services = self.services.read().await;
        for cells in services.values() {
            if let Some(pos) = position_of(cells, instance_id).await {
                return Some(cells[pos].clone());
            }
        }
        None
    }
}

async fn run_reaper(registry: Weak<ServiceRegistry>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(live) = registry.upgrade() else {
            break;
        };
        let removed = live.cleanup_expired_instances().await;
        if removed > 0 {
            info!("Reaper removed {} expired instances", removed);
        }
    }
}

async fn position_of(cells: &[InstanceCell], instance_id: &str) -> Option<usize> {
    for (pos, cell) in cells.iter().enumerate() {
        if cell.read().await.id == instance_id {
            return Some(pos);
        }
    }
    None
}

async fn snapshot(cells: &[InstanceCell]) -> Vec<ServiceInstance> {
    let mut instances = Vec::with_capacity(cells.len());
    for cell in cells {
        instances.push(cell.read().await.clone());
    }
    instances
}

fn count_status(instances: &[ServiceInstance], status: InstanceStatus) -> usize {
    instances.iter().filter(|i| i.status == status).count()
}
