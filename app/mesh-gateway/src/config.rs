//! Configuration for the mesh gateway
//!
//! Every component gets an explicit configuration struct. The root
//! [`GatewayConfig`] is validated once at construction time so that the
//! registry, gateway and tracer never have to second-guess their settings.

use crate::{error::GatewayError, types::ServiceRegistration};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway identifier
    pub gateway_id: String,

    /// Listen address for the HTTP surface
    pub gateway_endpoint: String,

    /// Forwarding timeout used when a route does not set one
    pub default_timeout: Duration,

    /// Advisory retry budget reported to callers (retries are not automated)
    pub retry_attempts: u32,

    /// Advisory delay between caller retries
    pub retry_delay: Duration,

    /// Enable per-route rate limiting
    pub enable_rate_limit: bool,

    /// Enable per-service circuit breaking
    pub enable_circuit_breaker: bool,

    /// Authentication and CORS settings
    pub security: SecurityConfig,

    /// Route table
    pub routes: Vec<RouteConfig>,

    /// Service registry settings
    pub registry: RegistryConfig,

    /// Distributed tracing settings
    pub tracing: TracingConfig,

    /// Statically known instances registered at startup
    pub services: Vec<ServiceRegistration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: uuid::Uuid::new_v4().to_string(),
            gateway_endpoint: crate::DEFAULT_GATEWAY_ENDPOINT.to_string(),
            default_timeout: Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            enable_rate_limit: true,
            enable_circuit_breaker: true,
            security: SecurityConfig::default(),
            routes: default_routes(),
            registry: RegistryConfig::default(),
            tracing: TracingConfig::default(),
            services: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the file named by `GATEWAY_CONFIG`, then apply
    /// environment overrides
    pub async fn load() -> Result<Self, GatewayError> {
        let config_path =
            std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "config/gateway.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            let config = Self::from_file(&config_path).await?;
            info!("Loaded configuration from {}", config_path);
            config
        } else {
            warn!("No configuration found at {}, using defaults", config_path);
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: GatewayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(gateway_id) = std::env::var("GATEWAY_ID") {
            self.gateway_id = gateway_id;
        }
        if let Ok(endpoint) = std::env::var("GATEWAY_ENDPOINT") {
            self.gateway_endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("JAEGER_ENDPOINT") {
            self.tracing.jaeger_endpoint = Some(endpoint);
        }
        if let Ok(endpoint) = std::env::var("ZIPKIN_ENDPOINT") {
            self.tracing.zipkin_endpoint = Some(endpoint);
        }
    }

    /// Validate the whole configuration tree
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.default_timeout.is_zero() {
            return Err(GatewayError::Configuration(
                "default_timeout must be greater than zero".to_string(),
            ));
        }

        for route in &self.routes {
            route.validate()?;
        }

        for service in &self.services {
            if service.name.is_empty() || service.host.is_empty() {
                return Err(GatewayError::Configuration(format!(
                    "Static service registration requires name and host: {:?}",
                    service
                )));
            }
        }

        self.security.validate()?;
        self.registry.validate()?;
        self.tracing.validate()
    }
}

/// Service registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Health check settings
    pub health_check: HealthCheckConfig,

    /// Load balancing strategy, fixed per deployment
    pub load_balancing: LoadBalancingStrategy,

    /// Instances without a heartbeat for this long are removed
    pub heartbeat_timeout: Duration,

    /// How often the reaper looks for expired instances
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check: HealthCheckConfig::default(),
            load_balancing: LoadBalancingStrategy::RoundRobin,
            heartbeat_timeout: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        self.health_check.validate()?;

        if self.heartbeat_timeout.is_zero() || self.cleanup_interval.is_zero() {
            return Err(GatewayError::Configuration(
                "heartbeat_timeout and cleanup_interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load balancing strategies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Delay between the end of one round and the start of the next
    pub interval: Duration,

    /// Probe timeout
    pub timeout: Duration,

    /// Consecutive failures before an instance is marked unhealthy
    pub unhealthy_threshold: u32,

    /// Consecutive successes before an instance is marked healthy
    pub healthy_threshold: u32,

    /// User agent sent with probes
    pub user_agent: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            user_agent: format!("{}-registry/{}", crate::GATEWAY_NAME, crate::GATEWAY_VERSION),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.unhealthy_threshold == 0 || self.healthy_threshold == 0 {
            return Err(GatewayError::Configuration(
                "Health check thresholds must be at least 1".to_string(),
            ));
        }
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(GatewayError::Configuration(
                "Health check interval and timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// Exact path or `/prefix/*`
    pub path: String,

    /// Target service group
    pub service_name: String,

    /// Allowed HTTP methods
    pub methods: Vec<String>,

    /// Remove the matched prefix before forwarding
    #[serde(default)]
    pub strip_path: bool,

    /// Forward the caller's `Host` header unchanged
    #[serde(default)]
    pub preserve_host: bool,

    /// Forwarding timeout, falls back to the gateway default
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Advisory retry count
    #[serde(default)]
    pub retries: u32,

    /// Per-client rate limit for this route
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Circuit breaker for the target service
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl RouteConfig {
    /// Create a wildcard-free route with no protection
    pub fn new(path: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service_name: service_name.into(),
            methods: vec!["GET".to_string()],
            strip_path: false,
            preserve_host: false,
            timeout: None,
            retries: 0,
            rate_limit: None,
            circuit_breaker: None,
        }
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_uppercase()).collect();
        self
    }

    pub fn with_strip_path(mut self, strip_path: bool) -> Self {
        self.strip_path = strip_path;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_rate_limit(mut self, requests: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimitConfig { requests, window });
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Whether the route is a `/prefix/*` wildcard
    pub fn is_wildcard(&self) -> bool {
        self.path.ends_with("/*")
    }

    /// Path with the trailing `/*` removed
    pub fn prefix(&self) -> &str {
        self.path.strip_suffix("/*").unwrap_or(&self.path)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if !self.path.starts_with('/') {
            return Err(GatewayError::Configuration(format!(
                "Route path must start with '/': {}",
                self.path
            )));
        }
        if self.prefix().contains('*') {
            return Err(GatewayError::Configuration(format!(
                "Wildcards are only allowed as a trailing '/*': {}",
                self.path
            )));
        }
        if self.service_name.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "Route {} has no target service",
                self.path
            )));
        }
        if self.methods.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "Route {} allows no methods",
                self.path
            )));
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(GatewayError::Configuration(format!(
                "Route {} has a zero timeout",
                self.path
            )));
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.validate()?;
        }
        Ok(())
    }
}

/// Fixed-window rate limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub requests: u32,

    /// Window length
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.requests == 0 || self.window.is_zero() {
            return Err(GatewayError::Configuration(
                "Rate limit requires requests > 0 and a non-zero window".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Upper bound on a protected call
    pub timeout: Duration,

    /// Cooldown before a half-open probe is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.failure_threshold == 0 {
            return Err(GatewayError::Configuration(
                "Circuit breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(GatewayError::Configuration(
                "Circuit breaker timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require a bearer token
    pub enable_auth: bool,

    /// Accepted bearer tokens
    pub auth_tokens: Vec<String>,

    /// Path prefixes that bypass authentication
    pub skip_auth_paths: Vec<String>,

    /// Enable CORS handling
    pub enable_cors: bool,

    /// `Access-Control-Allow-Origin`
    pub cors_allow_origin: String,

    /// `Access-Control-Allow-Methods`
    pub cors_allow_methods: String,

    /// `Access-Control-Allow-Headers`
    pub cors_allow_headers: String,

    /// `Access-Control-Max-Age` in seconds
    pub cors_max_age: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_auth: false,
            auth_tokens: Vec::new(),
            skip_auth_paths: vec![
                "/api/auth/login".to_string(),
                "/api/auth/register".to_string(),
                "/api/health".to_string(),
            ],
            enable_cors: true,
            cors_allow_origin: "*".to_string(),
            cors_allow_methods: "GET, POST, PUT, DELETE, OPTIONS".to_string(),
            cors_allow_headers: "Content-Type, Authorization".to_string(),
            cors_max_age: 86400,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.enable_auth && self.auth_tokens.is_empty() {
            return Err(GatewayError::Configuration(
                "Authentication is enabled but no auth_tokens are configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Distributed tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Open traces around gateway requests
    pub enabled: bool,

    /// Service name stamped on spans
    pub service_name: String,

    /// Service version stamped on traces
    pub service_version: String,

    /// Deployment environment stamped on traces
    pub environment: String,

    /// Fraction of completed traces that are exported
    pub sampling_rate: f64,

    /// Completed traces exported per batch
    pub batch_size: usize,

    /// Period of the batch export timer
    pub export_interval: Duration,

    /// Completed traces kept while waiting for export
    pub max_pending_traces: usize,

    /// Live traces older than this are force-finished by the export worker
    pub max_trace_age: Duration,

    /// Log a summary of every exported trace
    pub console_exporter: bool,

    /// Jaeger collector base URL
    pub jaeger_endpoint: Option<String>,

    /// Zipkin collector base URL
    pub zipkin_endpoint: Option<String>,

    /// Timeout for exporter HTTP calls
    pub exporter_timeout: Duration,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: crate::GATEWAY_NAME.to_string(),
            service_version: crate::GATEWAY_VERSION.to_string(),
            environment: "production".to_string(),
            sampling_rate: 1.0,
            batch_size: 100,
            export_interval: Duration::from_secs(5),
            max_pending_traces: 10_000,
            max_trace_age: Duration::from_secs(300),
            console_exporter: true,
            jaeger_endpoint: None,
            zipkin_endpoint: None,
            exporter_timeout: Duration::from_secs(10),
        }
    }
}

impl TracingConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(GatewayError::Configuration(format!(
                "sampling_rate must be within [0, 1], got {}",
                self.sampling_rate
            )));
        }
        if self.batch_size == 0 || self.max_pending_traces == 0 {
            return Err(GatewayError::Configuration(
                "batch_size and max_pending_traces must be at least 1".to_string(),
            ));
        }
        if self.export_interval.is_zero() || self.max_trace_age.is_zero() {
            return Err(GatewayError::Configuration(
                "export_interval and max_trace_age must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stock route table
pub fn default_routes() -> Vec<RouteConfig> {
    let minute = Duration::from_secs(60);

    vec![
        RouteConfig::new("/api/ai/*", "ai-service")
            .with_methods(&["GET", "POST"])
            .with_strip_path(true)
            .with_timeout(Duration::from_secs(60))
            .with_retries(2)
            .with_rate_limit(100, minute)
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 5,
                timeout: Duration::from_secs(30),
                reset_timeout: Duration::from_secs(60),
            }),
        RouteConfig::new("/api/projects/*", "project-service")
            .with_methods(&["GET", "POST", "PUT", "DELETE"])
            .with_strip_path(true)
            .with_timeout(Duration::from_secs(30))
            .with_retries(3)
            .with_rate_limit(200, minute),
        RouteConfig::new("/api/auth/*", "auth-service")
            .with_methods(&["GET", "POST"])
            .with_strip_path(true)
            .with_timeout(Duration::from_secs(15))
            .with_retries(2)
            .with_rate_limit(50, minute),
        // uploads take longer
        RouteConfig::new("/api/files/*", "file-service")
            .with_methods(&["GET", "POST", "PUT", "DELETE"])
            .with_strip_path(true)
            .with_timeout(Duration::from_secs(120))
            .with_retries(1)
            .with_rate_limit(30, minute),
        RouteConfig::new("/api/deploy/*", "deployment-service")
            .with_methods(&["GET", "POST"])
            .with_strip_path(true)
            .with_timeout(Duration::from_secs(300))
            .with_retries(1)
            .with_rate_limit(10, minute),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routes.len(), 5);
        assert_eq!(config.registry.health_check.healthy_threshold, 2);
        assert_eq!(config.registry.health_check.unhealthy_threshold, 3);
        assert_eq!(config.registry.heartbeat_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_route_validation() {
        assert!(RouteConfig::new("/api/*", "svc").validate().is_ok());
        assert!(RouteConfig::new("api/*", "svc").validate().is_err());
        assert!(RouteConfig::new("/api/*/x", "svc").validate().is_err());
        assert!(RouteConfig::new("/api", "").validate().is_err());
        assert!(RouteConfig::new("/api", "svc")
            .with_rate_limit(0, Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_route_prefix() {
        let route = RouteConfig::new("/api/ai/*", "ai-service");
        assert!(route.is_wildcard());
        assert_eq!(route.prefix(), "/api/ai");

        let exact = RouteConfig::new("/health", "svc");
        assert!(!exact.is_wildcard());
        assert_eq!(exact.prefix(), "/health");
    }

    #[test]
    fn test_sampling_rate_bounds() {
        let mut config = GatewayConfig::default();
        config.tracing.sampling_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_requires_tokens() {
        let mut config = GatewayConfig::default();
        config.security.enable_auth = true;
        assert!(config.validate().is_err());
        config.security.auth_tokens = vec!["secret-token-value".to_string()];
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
gateway_id = "gw-test"
enable_rate_limit = false

[registry]
load_balancing = "least-connections"

[registry.health_check]
healthy_threshold = 1

[[routes]]
path = "/api/echo/*"
service_name = "echo"
methods = ["GET"]
strip_path = true

[[services]]
name = "echo"
version = "1.0.0"
host = "127.0.0.1"
port = 9000
"#,
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path).await.unwrap();
        assert_eq!(config.gateway_id, "gw-test");
        assert!(!config.enable_rate_limit);
        assert_eq!(
            config.registry.load_balancing,
            LoadBalancingStrategy::LeastConnections
        );
        assert_eq!(config.registry.health_check.healthy_threshold, 1);
        assert_eq!(config.registry.health_check.unhealthy_threshold, 3);
        assert_eq!(config.routes.len(), 1);
        assert!(config.routes[0].strip_path);
        assert_eq!(config.services[0].port, 9000);
        assert!(config.validate().is_ok());
    }
}
