//! Instance health checking
//!
//! Each instance with a health URL gets its own probe task. A round is one
//! GET with a bounded timeout; the next round is scheduled only after the
//! current one finishes, so a slow instance never delays another's checks.

use crate::{
    client::{HttpClient, OutboundRequest},
    config::HealthCheckConfig,
    types::{current_timestamp_ms, InstanceStatus, ServiceInstance},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hysteresis counters for one instance
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl HealthCheck {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy_threshold: config.healthy_threshold,
            unhealthy_threshold: config.unhealthy_threshold,
        }
    }

    /// Record the outcome of one round and return the new status if the
    /// instance should flip.
    pub fn record(&mut self, success: bool, current: InstanceStatus) -> Option<InstanceStatus> {
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;

            if current != InstanceStatus::Healthy
                && self.consecutive_successes >= self.healthy_threshold
            {
                return Some(InstanceStatus::Healthy);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;

            if current != InstanceStatus::Unhealthy
                && self.consecutive_failures >= self.unhealthy_threshold
            {
                return Some(InstanceStatus::Unhealthy);
            }
        }

        None
    }
}

/// Handle to a running probe task
#[derive(Debug)]
pub struct HealthCheckHandle {
    is_running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HealthCheckHandle {
    /// Spawn the probe loop for `instance`
    pub fn spawn(
        instance: Arc<RwLock<ServiceInstance>>,
        url: String,
        client: Arc<dyn HttpClient>,
        config: HealthCheckConfig,
    ) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_health_checks(
            instance,
            url,
            client,
            config,
            is_running.clone(),
        ));

        Self { is_running, task }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Stop the loop; an in-flight probe is abandoned
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for HealthCheckHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_health_checks(
    instance: Arc<RwLock<ServiceInstance>>,
    url: String,
    client: Arc<dyn HttpClient>,
    config: HealthCheckConfig,
    is_running: Arc<AtomicBool>,
) {
    let mut check = HealthCheck::new(&config);

    while is_running.load(Ordering::SeqCst) {
        let success = probe(client.as_ref(), &url, &config).await;

        if !is_running.load(Ordering::SeqCst) {
            break;
        }

        {
            let mut instance = instance.write().await;
            if let Some(next) = check.record(success, instance.status) {
                match next {
                    InstanceStatus::Healthy => {
                        info!("Instance {} ({}) is healthy", instance.name, instance.id)
                    }
                    _ => warn!(
                        "Instance {} ({}) is unhealthy after {} failed checks",
                        instance.name, instance.id, check.consecutive_failures
                    ),
                }
                instance.status = next;
            }
            instance.last_heartbeat = current_timestamp_ms();
        }

        tokio::time::sleep(config.interval).await;
    }
}

async fn probe(client: &dyn HttpClient, url: &str, config: &HealthCheckConfig) -> bool {
    let request = OutboundRequest::get(url, config.timeout).with_header("User-Agent", &config.user_agent);

    match client.send(request).await {
        Ok(response) if response.is_success() => {
            debug!("Health check passed for {}", url);
            true
        }
        Ok(response) => {
            debug!("Health check failed for {}: status {}", url, response.status);
            false
        }
        Err(e) => {
            debug!("Health check error for {}: {}", url, e);
            false
        }
    }
}
