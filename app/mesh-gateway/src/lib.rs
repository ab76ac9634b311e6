//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Mesh gateway: an in-process service mesh control plane
//!
//! This crate provides a service registry with health checking and load
//! balancing, an API gateway with a middleware pipeline, rate limiting and
//! circuit breaking, and a distributed tracer that follows requests through
//! the gateway to their backends.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod http;
pub mod load_balancer;
pub mod routing;
pub mod telemetry;
pub mod types;

// Re-export main types
pub use client::{HttpClient, ReqwestHttpClient};
pub use config::GatewayConfig;
pub use discovery::ServiceRegistry;
pub use error::GatewayError;
pub use gateway::ApiGateway;
pub use telemetry::DistributedTracer;
pub use types::*;

use std::sync::Arc;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway version information
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway name
pub const GATEWAY_NAME: &str = "mesh-gateway";

/// Default gateway endpoint
pub const DEFAULT_GATEWAY_ENDPOINT: &str = "0.0.0.0:8080";

/// Default request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Registry, gateway and tracer wired together
pub struct ControlPlane {
    pub registry: Arc<ServiceRegistry>,
    pub gateway: Arc<ApiGateway>,
    pub tracer: Option<Arc<DistributedTracer>>,
}

/// Build and start every component described by `config`
pub async fn init_control_plane(
    config: GatewayConfig,
    client: Arc<dyn HttpClient>,
) -> GatewayResult<ControlPlane> {
    tracing::info!("Initializing {} v{}", GATEWAY_NAME, GATEWAY_VERSION);
    config.validate()?;

    let registry = Arc::new(ServiceRegistry::new(config.registry.clone(), client.clone())?);
    registry.start().await;

    for service in &config.services {
        let id = registry.register_service(service.clone()).await?;
        tracing::info!("Registered static service {} as {}", service.name, id);
    }

    let tracer = if config.tracing.enabled {
        let tracer = Arc::new(
            DistributedTracer::with_configured_exporters(config.tracing.clone(), client.clone())
                .await?,
        );
        tracer.start().await;
        Some(tracer)
    } else {
        None
    };

    let gateway = Arc::new(ApiGateway::new(config, registry.clone(), client, tracer.clone()).await?);
    gateway.start().await?;

    tracing::info!("Control plane initialization completed");
    Ok(ControlPlane {
        registry,
        gateway,
        tracer,
    })
}

impl ControlPlane {
    /// Stop the gateway, flush traces and stop every background task
    pub async fn shutdown(&self) -> GatewayResult<()> {
        tracing::info!("Shutting down control plane");

        self.gateway.close().await?;
        if let Some(tracer) = &self.tracer {
            tracer.close().await;
        }
        self.registry.close().await;

        tracing::info!("Control plane shutdown completed");
        Ok(())
    }
}
