//! Load balancer
//!
//! Strategies only ever see the already health-filtered candidate set, in
//! registration order.

use crate::{config::LoadBalancingStrategy, types::ServiceInstance};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Instance selector for the registry
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    round_robin_counters: DashMap<String, AtomicUsize>,
    connection_counts: Arc<DashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            round_robin_counters: DashMap::new(),
            connection_counts: Arc::new(DashMap::new()),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Pick one of `candidates`, `None` when the set is empty
    pub fn select(
        &self,
        service_name: &str,
        candidates: &[ServiceInstance],
    ) -> Option<ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(service_name, candidates),
            LoadBalancingStrategy::WeightedRoundRobin => self.select_weighted(candidates),
            LoadBalancingStrategy::LeastConnections => self.select_least_connections(candidates),
            LoadBalancingStrategy::Random => {
                &candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
        };

        debug!(
            "Selected instance {} for service {} ({:?})",
            selected.id, service_name, self.strategy
        );
        Some(selected.clone())
    }

    fn select_round_robin<'a>(
        &self,
        service_name: &str,
        candidates: &'a [ServiceInstance],
    ) -> &'a ServiceInstance {
        let index = self
            .round_robin_counters
            .entry(service_name.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);

        &candidates[index % candidates.len()]
    }

    fn select_weighted<'a>(&self, candidates: &'a [ServiceInstance]) -> &'a ServiceInstance {
        let total: u64 = candidates.iter().map(|i| i.weight as u64).sum();
        if total == 0 {
            return &candidates[0];
        }

        let mut point = rand::thread_rng().gen_range(0..total);
        for instance in candidates {
            let weight = instance.weight as u64;
            if point < weight {
                return instance;
            }
            point -= weight;
        }

        &candidates[candidates.len() - 1]
    }

    fn select_least_connections<'a>(
        &self,
        candidates: &'a [ServiceInstance],
    ) -> &'a ServiceInstance {
        candidates
            .iter()
            .min_by_key(|instance| self.active_connections(&instance.id))
            .unwrap_or(&candidates[0])
    }

    /// Count an in-flight call against `instance_id` until the guard drops
    pub fn acquire(&self, instance_id: &str) -> ConnectionGuard {
        *self
            .connection_counts
            .entry(instance_id.to_string())
            .or_insert(0) += 1;

        ConnectionGuard {
            instance_id: instance_id.to_string(),
            counts: self.connection_counts.clone(),
        }
    }

    pub fn active_connections(&self, instance_id: &str) -> usize {
        self.connection_counts
            .get(instance_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Drop bookkeeping for a removed instance or service
    pub fn forget_instance(&self, instance_id: &str) {
        self.connection_counts.remove(instance_id);
    }

    pub fn forget_service(&self, service_name: &str) {
        self.round_robin_counters.remove(service_name);
    }
}

/// Releases one connection slot on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    instance_id: String,
    counts: Arc<DashMap<String, usize>>,
}

impl ConnectionGuard {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.instance_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceStatus, Protocol};
    use std::collections::HashMap;

    fn instance(id: &str, weight: u32) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            name: "svc".to_string(),
            version: "1.0.0".to_string(),
            host: "localhost".to_string(),
            port: 8000,
            protocol: Protocol::Http,
            health_check_url: None,
            status: InstanceStatus::Healthy,
            tags: Vec::new(),
            weight,
            registered_at: 0,
            last_heartbeat: 0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
        let candidates = vec![instance("a", 100), instance("b", 100), instance("c", 100)];

        let first: Vec<String> = (0..3)
            .map(|_| lb.select("svc", &candidates).unwrap().id)
            .collect();
        assert_eq!(first, vec!["a", "b", "c"]);

        assert_eq!(lb.select("svc", &candidates).unwrap().id, "a");
    }

    #[test]
    fn test_round_robin_counters_are_per_service() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
        let candidates = vec![instance("a", 100), instance("b", 100)];

        assert_eq!(lb.select("one", &candidates).unwrap().id, "a");
        assert_eq!(lb.select("two", &candidates).unwrap().id, "a");
        assert_eq!(lb.select("one", &candidates).unwrap().id, "b");
    }

    #[test]
    fn test_weighted_skips_zero_weight() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::WeightedRoundRobin);
        let candidates = vec![instance("zero", 0), instance("heavy", 10)];

        for _ in 0..50 {
            assert_eq!(lb.select("svc", &candidates).unwrap().id, "heavy");
        }
    }

    #[test]
    fn test_weighted_all_zero_falls_back_to_first() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::WeightedRoundRobin);
        let candidates = vec![instance("a", 0), instance("b", 0)];
        assert_eq!(lb.select("svc", &candidates).unwrap().id, "a");
    }

    #[test]
    fn test_least_connections_uses_live_counts() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::LeastConnections);
        let candidates = vec![instance("a", 100), instance("b", 100)];

        let guard = lb.acquire("a");
        assert_eq!(lb.active_connections("a"), 1);
        assert_eq!(lb.select("svc", &candidates).unwrap().id, "b");

        drop(guard);
        assert_eq!(lb.active_connections("a"), 0);
        assert_eq!(lb.select("svc", &candidates).unwrap().id, "a");
    }

    #[test]
    fn test_empty_candidates() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::Random);
        assert!(lb.select("svc", &[]).is_none());
    }
}
