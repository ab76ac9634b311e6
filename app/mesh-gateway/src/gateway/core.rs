//! Main gateway core implementation

use crate::{
    client::HttpClient,
    config::{GatewayConfig, RouteConfig},
    discovery::ServiceRegistry,
    error::GatewayError,
    gateway::{
        circuit_breaker::{CircuitBreakerState, CircuitBreakerStats, CircuitBreakers},
        middleware::{
            AuthMiddleware, CorsMiddleware, Endpoint, LoggingMiddleware, Middleware,
            MiddlewarePipeline, RateLimitMiddleware, RequestContext,
        },
        rate_limiter::{RateLimiterStats, RateLimiters},
        state::{GatewayMetrics, GatewayMetricsSnapshot, GatewayState},
    },
    routing::{Forwarder, RouteMatch, RouteTable},
    telemetry::{
        extract, inject, DistributedTracer, FinishSpanOptions, PropagationFormat, Span, SpanKind,
        SpanOptions, TraceOptions,
    },
    types::{GatewayInfo, GatewayRequest, GatewayResponse, GatewayStatus, ServiceInstance},
    GatewayResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Snapshot returned by [`ApiGateway::get_gateway_stats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStats {
    pub total_routes: usize,
    pub total_middleware: usize,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub rate_limiters: Vec<RateLimiterStats>,
    pub requests: GatewayMetricsSnapshot,
}

/// API gateway: middleware chain, routing, discovery, protection and
/// forwarding for every inbound request
pub struct ApiGateway {
    /// Gateway configuration
    config: GatewayConfig,

    /// Gateway state
    state: RwLock<GatewayState>,

    /// Service registry used for discovery
    registry: Arc<ServiceRegistry>,

    /// Route table
    routes: Arc<RouteTable>,

    /// Middleware chain
    middleware: MiddlewarePipeline,

    /// Per-route rate limiters
    rate_limiters: Arc<RateLimiters>,

    /// Per-service circuit breakers
    circuit_breakers: CircuitBreakers,

    /// Backend forwarder
    forwarder: Forwarder,

    /// Request tracer
    tracer: Option<Arc<DistributedTracer>>,

    /// Request counters
    metrics: GatewayMetrics,
}

impl ApiGateway {
    /// Create a gateway with the built-in middleware installed
    pub async fn new(
        config: GatewayConfig,
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn HttpClient>,
        tracer: Option<Arc<DistributedTracer>>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let routes = Arc::new(RouteTable::from_routes(config.routes.clone())?);
        let rate_limiters = Arc::new(RateLimiters::new());

        let middleware = MiddlewarePipeline::new();
        middleware.add(Arc::new(LoggingMiddleware)).await;
        middleware
            .add(Arc::new(AuthMiddleware::from_config(&config.security)))
            .await;
        if config.security.enable_cors {
            middleware
                .add(Arc::new(CorsMiddleware::from_config(&config.security)))
                .await;
        }
        if config.enable_rate_limit {
            middleware
                .add(Arc::new(RateLimitMiddleware::new(
                    routes.clone(),
                    rate_limiters.clone(),
                )))
                .await;
        }

        Ok(Self {
            state: RwLock::new(GatewayState::new(&config)),
            config,
            registry,
            routes,
            middleware,
            rate_limiters,
            circuit_breakers: CircuitBreakers::new(),
            forwarder: Forwarder::new(client),
            tracer,
            metrics: GatewayMetrics::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn tracer(&self) -> Option<&Arc<DistributedTracer>> {
        self.tracer.as_ref()
    }

    /// Start the gateway
    pub async fn start(&self) -> GatewayResult<()> {
        info!("Starting mesh gateway {}", self.config.gateway_id);
        self.state.write().await.set_status(GatewayStatus::Running);
        info!(
            "Mesh gateway started with {} routes",
            self.routes.len().await
        );
        Ok(())
    }

    /// Stop accepting traffic
    pub async fn close(&self) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        if state.get_status() == GatewayStatus::Stopped {
            return Err(GatewayError::Shutdown("Gateway already stopped".to_string()));
        }

        state.set_status(GatewayStatus::Stopping);
        info!("Stopping mesh gateway {}", self.config.gateway_id);
        state.set_status(GatewayStatus::Stopped);
        Ok(())
    }

    pub async fn info(&self) -> GatewayInfo {
        self.state.read().await.get_gateway_info()
    }

    /// Handle one request end to end. Every outcome, including internal
    /// failures, is expressed as a response.
    pub async fn handle_request(&self, request: GatewayRequest) -> GatewayResponse {
        let mut ctx = RequestContext::new(request);
        self.open_trace(&mut ctx).await;

        let result = self.middleware.execute(&mut ctx, &Dispatcher(self)).await;
        let response = match (result, ctx.response.take()) {
            (Ok(()), Some(response)) => response,
            (Ok(()), None) => {
                error!(request_id = %ctx.request_id, "Request finished without a response");
                GatewayResponse::error(500, "Internal server error")
            }
            (Err(e), _) => {
                error!(request_id = %ctx.request_id, "Gateway request failed: {}", e);
                GatewayResponse::error(500, "Internal server error")
            }
        };

        self.metrics.record(response.status, ctx.start_time.elapsed());
        self.close_trace(&ctx, &response).await;
        response
    }

    /// Add or replace a route; its rate limiter starts fresh
    pub async fn add_route(&self, route: RouteConfig) -> GatewayResult<()> {
        let path = route.path.clone();
        self.routes.add_route(route).await?;
        self.rate_limiters.remove(&path);
        Ok(())
    }

    pub async fn remove_route(&self, path: &str) -> bool {
        self.rate_limiters.remove(path);
        self.routes.remove_route(path).await
    }

    pub async fn routes(&self) -> Vec<RouteConfig> {
        self.routes.routes().await
    }

    pub async fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.add(middleware).await;
    }

    pub async fn middleware_names(&self) -> Vec<String> {
        self.middleware.names().await
    }

    pub fn circuit_breaker_state(&self, service: &str) -> Option<CircuitBreakerState> {
        self.circuit_breakers.state(service)
    }

    pub async fn get_gateway_stats(&self) -> GatewayStats {
        GatewayStats {
            total_routes: self.routes.len().await,
            total_middleware: self.middleware.len().await,
            circuit_breakers: self.circuit_breakers.stats(),
            rate_limiters: self.rate_limiters.stats(),
            requests: self.metrics.snapshot(),
        }
    }

    /// Route, discover, check the breaker and forward
    async fn dispatch(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let route = match ctx.route.take() {
            Some(route) => route,
            None => match self.routes.find_route(&ctx.path, &ctx.method).await {
                Some(route) => route,
                None => {
                    warn!("No route for {} {}", ctx.method, ctx.path);
                    ctx.respond(GatewayResponse::error(404, "Route not found"));
                    return Ok(());
                }
            },
        };
        let service = route.service_name().to_string();

        let Some(instance) = self.discover(ctx, &service).await else {
            warn!("No healthy instance of {} for {}", service, ctx.path);
            ctx.respond(GatewayResponse::error(503, "Service unavailable"));
            return Ok(());
        };

        let breaker = route
            .route
            .circuit_breaker
            .filter(|_| self.config.enable_circuit_breaker);
        if let Some(breaker) = &breaker {
            if self.circuit_breakers.is_open(&service, breaker) {
                debug!("Circuit open for {}, rejecting {}", service, ctx.path);
                ctx.respond(GatewayResponse::error(503, "Service circuit breaker is open"));
                return Ok(());
            }
        }

        let mut timeout = route.route.timeout.unwrap_or(self.config.default_timeout);
        if let Some(breaker) = &breaker {
            timeout = timeout.min(breaker.timeout);
        }

        let span = self
            .start_span(
                ctx,
                &format!("forward {}", service),
                SpanOptions::default()
                    .with_kind(SpanKind::Client)
                    .with_tag("instance.id", instance.id.clone())
                    .with_tag("http.url", format!("{}{}", instance.url(), route.target_path)),
            )
            .await;
        let mut trace_headers = HashMap::new();
        if let Some(span) = &span {
            inject(span, PropagationFormat::HttpHeaders, &mut trace_headers);
        }

        let result = self
            .forward(&instance, &route, ctx, trace_headers, timeout)
            .await;

        match result {
            Ok(response) => {
                if breaker.is_some() {
                    self.circuit_breakers.record_success(&service);
                }
                self.finish_span(
                    span,
                    FinishSpanOptions::ok().with_tag("http.status_code", response.status),
                )
                .await;
                ctx.respond(response);
            }
            Err(e) => {
                if let Some(breaker) = &breaker {
                    self.circuit_breakers.record_failure(&service, breaker);
                }
                error!("Forwarding to {} ({}) failed: {}", service, instance.id, e);
                self.finish_span(span, FinishSpanOptions::error(e.to_string()))
                    .await;
                ctx.respond(GatewayResponse::error(502, "Bad gateway"));
            }
        }
        ctx.route = Some(route);
        Ok(())
    }

    async fn discover(&self, ctx: &RequestContext, service: &str) -> Option<ServiceInstance> {
        let span = self
            .start_span(
                ctx,
                "registry.discover",
                SpanOptions::default().with_tag("service.name", service),
            )
            .await;

        let instance = self.registry.discover_service(service, None).await;

        let options = match &instance {
            Some(instance) => FinishSpanOptions::ok().with_tag("instance.id", instance.id.clone()),
            None => FinishSpanOptions::ok().with_tag("instance.found", false),
        };
        self.finish_span(span, options).await;
        instance
    }

    async fn forward(
        &self,
        instance: &ServiceInstance,
        route: &RouteMatch,
        ctx: &RequestContext,
        headers: HashMap<String, String>,
        timeout: std::time::Duration,
    ) -> GatewayResult<GatewayResponse> {
        let _connection = self.registry.acquire_connection(&instance.id);
        self.forwarder
            .forward(instance, route, ctx, headers, timeout)
            .await
    }

    async fn open_trace(&self, ctx: &mut RequestContext) {
        let Some(tracer) = &self.tracer else {
            return;
        };

        let parent = extract(PropagationFormat::HttpHeaders, &ctx.headers);
        let trace = tracer
            .start_trace(
                &format!("{} {}", ctx.method, ctx.path),
                TraceOptions::default()
                    .with_kind(SpanKind::Server)
                    .with_parent(parent)
                    .with_tag("http.method", ctx.method.clone())
                    .with_tag("http.path", ctx.path.clone())
                    .with_tag("request.id", ctx.request_id.clone()),
            )
            .await;

        ctx.span_id = trace.root_span_id().map(String::from);
        ctx.trace_id = Some(trace.trace_id);
    }

    async fn close_trace(&self, ctx: &RequestContext, response: &GatewayResponse) {
        let (Some(tracer), Some(span_id)) = (&self.tracer, &ctx.span_id) else {
            return;
        };

        let mut options = if response.status >= 500 {
            FinishSpanOptions::error(error_message(response))
        } else {
            FinishSpanOptions::ok()
        };
        options
            .tags
            .insert("http.status_code".to_string(), Value::from(response.status));
        tracer.finish_span(span_id, options).await;
    }

    async fn start_span(&self, ctx: &RequestContext, operation: &str, options: SpanOptions) -> Option<Span> {
        let tracer = self.tracer.as_ref()?;
        let parent = ctx.span_id.as_deref()?;

        match tracer.create_child_span(parent, operation, options).await {
            Ok(span) => Some(span),
            Err(e) => {
                debug!("Could not start span {}: {}", operation, e);
                None
            }
        }
    }

    async fn finish_span(&self, span: Option<Span>, options: FinishSpanOptions) {
        if let (Some(tracer), Some(span)) = (&self.tracer, span) {
            tracer.finish_span(&span.span_id, options).await;
        }
    }
}

fn error_message(response: &GatewayResponse) -> String {
    response
        .body
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", response.status))
}

/// Terminal pipeline stage
struct Dispatcher<'a>(&'a ApiGateway);

#[async_trait]
impl Endpoint for Dispatcher<'_> {
    async fn call(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        self.0.dispatch(ctx).await
    }
}
