//! Types for the mesh gateway

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Gateway lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Gateway information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInfo {
    /// Gateway identifier
    pub gateway_id: String,

    /// Gateway status
    pub status: GatewayStatus,

    /// Gateway version
    pub version: String,

    /// Gateway endpoint
    pub endpoint: String,

    /// Start timestamp (ms)
    pub started_at: u64,
}

/// Lifecycle status of a registered instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Wire protocol spoken by an instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Grpc,
}

impl Protocol {
    /// URL scheme used to reach the instance
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Https => "https",
            // gRPC backends are reached over plain HTTP/2
            Protocol::Http | Protocol::Grpc => "http",
        }
    }
}

/// Registration payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl ServiceRegistration {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            host: host.into(),
            port,
            protocol: Protocol::default(),
            health_check_url: None,
            metadata: HashMap::new(),
            tags: Vec::new(),
            weight: None,
        }
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// A running, addressable copy of a named service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub health_check_url: Option<String>,
    pub status: InstanceStatus,
    pub tags: Vec<String>,
    pub weight: u32,
    /// Registration time (ms since epoch)
    pub registered_at: u64,
    /// Last heartbeat (ms since epoch)
    pub last_heartbeat: u64,
    pub metadata: HashMap<String, Value>,
}

impl ServiceInstance {
    /// Base URL of the instance
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }

    /// Whether the instance carries every tag in `tags`
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Optional discovery filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DiscoveryOptions {
    pub fn version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            tags: Vec::new(),
        }
    }

    pub fn tags(tags: &[&str]) -> Self {
        Self {
            version: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if let Some(version) = &self.version {
            if &instance.version != version {
                return false;
            }
        }
        instance.has_tags(&self.tags)
    }
}

/// Availability of a service group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAvailability {
    Available,
    Degraded,
    Unavailable,
}

/// Aggregate health of a service group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub total_instances: usize,
    pub health_ratio: f64,
    pub status: ServiceAvailability,
    pub last_updated: u64,
}

/// Per-service registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGroupStats {
    pub name: String,
    pub instance_count: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub versions: Vec<String>,
}

/// Registry-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub services: Vec<ServiceGroupStats>,
}

/// Inbound request handed to the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub query: HashMap<String, String>,
}

impl GatewayRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response produced by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Value,
    pub headers: HashMap<String, String>,
}

impl GatewayResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            headers: HashMap::new(),
        }
    }

    /// JSON error body `{"error": message}`
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, serde_json::json!({ "error": message.into() }))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn current_timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 16 hex characters, used for trace and span ids
pub fn generate_short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}
