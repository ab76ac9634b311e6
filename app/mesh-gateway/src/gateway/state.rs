//! Gateway state management

use crate::{
    config::GatewayConfig,
    types::{current_timestamp_ms, GatewayInfo, GatewayStatus},
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Request counters, updated lock-free from every request
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    unauthorized: AtomicU64,
    not_found: AtomicU64,
    rate_limited: AtomicU64,
    bad_gateway: AtomicU64,
    unavailable: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// Point-in-time copy of [`GatewayMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub unauthorized: u64,
    pub not_found: u64,
    pub rate_limited: u64,
    pub bad_gateway: u64,
    pub unavailable: u64,
    pub avg_response_time_ms: f64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished request by its response status
    pub fn record(&self, status: u16, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);

        if status < 400 {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        let class = match status {
            401 => &self.unauthorized,
            404 => &self.not_found,
            429 => &self.rate_limited,
            502 => &self.bad_gateway,
            503 => &self.unavailable,
            _ => return,
        };
        class.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayMetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let latency = self.total_latency_ms.load(Ordering::Relaxed);

        GatewayMetricsSnapshot {
            total_requests: total,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            bad_gateway: self.bad_gateway.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            avg_response_time_ms: if total > 0 {
                latency as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Gateway state
#[derive(Debug)]
pub struct GatewayState {
    gateway_info: GatewayInfo,
}

impl GatewayState {
    /// Create a new gateway state
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            gateway_info: GatewayInfo {
                gateway_id: config.gateway_id.clone(),
                status: GatewayStatus::Starting,
                version: crate::GATEWAY_VERSION.to_string(),
                endpoint: config.gateway_endpoint.clone(),
                started_at: current_timestamp_ms(),
            },
        }
    }

    /// Get gateway information
    pub fn get_gateway_info(&self) -> GatewayInfo {
        self.gateway_info.clone()
    }

    /// Set gateway status
    pub fn set_status(&mut self, status: GatewayStatus) {
        self.gateway_info.status = status;
    }

    /// Get gateway status
    pub fn get_status(&self) -> GatewayStatus {
        self.gateway_info.status
    }
}
