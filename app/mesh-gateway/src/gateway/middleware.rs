//! Request middleware pipeline
//!
//! Middleware runs in ascending priority order. Each one either calls
//! [`Next::run`] to continue the chain or sets `ctx.response` and returns to
//! short-circuit it. The built-in chain is logging (1), authentication (2),
//! CORS (3) and rate limiting (4).

use crate::{
    config::{RateLimitConfig, SecurityConfig},
    gateway::rate_limiter::{RateLimitDecision, RateLimiters},
    routing::{RouteMatch, RouteTable},
    types::{generate_request_id, GatewayRequest, GatewayResponse},
    GatewayResult,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const LOGGING_PRIORITY: i32 = 1;
pub const AUTH_PRIORITY: i32 = 2;
pub const CORS_PRIORITY: i32 = 3;
pub const RATE_LIMIT_PRIORITY: i32 = 4;

/// Mutable per-request state shared by the middleware chain
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Upper-cased HTTP method
    pub method: String,
    pub path: String,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub query: HashMap<String, String>,
    pub start_time: Instant,
    pub client_id: String,
    /// Set by authentication
    pub user: Option<Value>,
    /// Set by whichever stage answers the request
    pub response: Option<GatewayResponse>,
    /// Route resolved earlier in the chain
    pub route: Option<RouteMatch>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl RequestContext {
    pub fn new(request: GatewayRequest) -> Self {
        let headers: HashMap<String, String> = request
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let client_id = client_id(&headers);

        Self {
            request_id: generate_request_id(),
            method: request.method.to_ascii_uppercase(),
            path: request.path,
            headers,
            body: request.body,
            query: request.query,
            start_time: Instant::now(),
            client_id,
            user: None,
            response: None,
            route: None,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn respond(&mut self, response: GatewayResponse) {
        self.response = Some(response);
    }
}

/// First hop of `x-forwarded-for`, then `x-real-ip`, else loopback
fn client_id(headers: &HashMap<String, String>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| headers.get("x-real-ip").map(String::as_str))
        .unwrap_or("127.0.0.1")
        .to_string()
}

/// A stage in the request pipeline
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first
    fn priority(&self) -> i32;

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<()>;
}

/// Terminal stage reached when every middleware called `next`
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &mut RequestContext) -> GatewayResult<()>;
}

/// Remainder of the chain
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(middleware: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self {
            remaining: middleware,
            endpoint,
        }
    }

    pub async fn run(self, ctx: &mut RequestContext) -> GatewayResult<()> {
        match self.remaining.split_first() {
            Some((current, rest)) => {
                current
                    .handle(ctx, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.call(ctx).await,
        }
    }
}

/// Priority-ordered middleware list. Sorting happens on insertion; requests
/// run against an immutable snapshot.
#[derive(Default)]
pub struct MiddlewarePipeline {
    middleware: RwLock<Arc<Vec<Arc<dyn Middleware>>>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping priority order; equal priorities keep insertion order
    pub async fn add(&self, middleware: Arc<dyn Middleware>) {
        let mut current = self.middleware.write().await;
        let mut updated: Vec<Arc<dyn Middleware>> = current.as_ref().clone();

        debug!(
            "Adding middleware {} (priority {})",
            middleware.name(),
            middleware.priority()
        );
        updated.push(middleware);
        updated.sort_by_key(|m| m.priority());
        *current = Arc::new(updated);
    }

    pub async fn snapshot(&self) -> Arc<Vec<Arc<dyn Middleware>>> {
        self.middleware.read().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        self.snapshot()
            .await
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.middleware.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.middleware.read().await.is_empty()
    }

    pub async fn execute(&self, ctx: &mut RequestContext, endpoint: &dyn Endpoint) -> GatewayResult<()> {
        let chain = self.snapshot().await;
        Next::new(&chain, endpoint).run(ctx).await
    }
}

/// Request logging and latency measurement
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "request-logger"
    }

    fn priority(&self) -> i32 {
        LOGGING_PRIORITY
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<()> {
        debug!(request_id = %ctx.request_id, "{} {}", ctx.method, ctx.path);

        let result = next.run(ctx).await;

        let latency = ctx.start_time.elapsed();
        let status = ctx.response.as_ref().map(|r| r.status).unwrap_or(0);
        if let Some(response) = ctx.response.as_mut() {
            response
                .headers
                .insert("X-Response-Time".to_string(), format!("{}ms", latency.as_millis()));
        }

        info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.path,
            status,
            latency_ms = latency.as_millis() as u64,
            "Request completed"
        );
        result
    }
}

/// Bearer token check
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// The authenticated principal, or `None` when the token is rejected
    async fn validate(&self, token: &str) -> Option<Value>;
}

/// Accepts a fixed set of tokens
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Option<Value> {
        if !self.tokens.contains(token) {
            return None;
        }
        // never echo the full token
        let suffix: String = token
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Some(json!({ "token": format!("...{}", suffix) }))
    }
}

pub struct AuthMiddleware {
    enabled: bool,
    skip_paths: Vec<String>,
    validator: Arc<dyn TokenValidator>,
}

impl AuthMiddleware {
    pub fn new(enabled: bool, skip_paths: Vec<String>, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            enabled,
            skip_paths,
            validator,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            config.enable_auth,
            config.skip_auth_paths.clone(),
            Arc::new(StaticTokenValidator::new(config.auth_tokens.iter().cloned())),
        )
    }

    fn is_skipped(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "authentication"
    }

    fn priority(&self) -> i32 {
        AUTH_PRIORITY
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<()> {
        if !self.enabled || self.is_skipped(&ctx.path) {
            return next.run(ctx).await;
        }

        let token = ctx
            .header("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string);
        let Some(token) = token else {
            debug!(request_id = %ctx.request_id, "Missing bearer token");
            ctx.respond(GatewayResponse::error(401, "Missing authentication token"));
            return Ok(());
        };

        match self.validator.validate(&token).await {
            Some(user) => {
                ctx.user = Some(user);
                next.run(ctx).await
            }
            None => {
                warn!(request_id = %ctx.request_id, path = %ctx.path, "Rejected bearer token");
                ctx.respond(GatewayResponse::error(401, "Invalid authentication token"));
                Ok(())
            }
        }
    }
}

/// Answers preflight requests and decorates every other response
pub struct CorsMiddleware {
    headers: Vec<(String, String)>,
}

impl CorsMiddleware {
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            headers: vec![
                (
                    "Access-Control-Allow-Origin".to_string(),
                    config.cors_allow_origin.clone(),
                ),
                (
                    "Access-Control-Allow-Methods".to_string(),
                    config.cors_allow_methods.clone(),
                ),
                (
                    "Access-Control-Allow-Headers".to_string(),
                    config.cors_allow_headers.clone(),
                ),
                (
                    "Access-Control-Max-Age".to_string(),
                    config.cors_max_age.to_string(),
                ),
            ],
        }
    }

    fn apply(&self, response: &mut GatewayResponse) {
        response.headers.extend(self.headers.iter().cloned());
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    fn priority(&self) -> i32 {
        CORS_PRIORITY
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<()> {
        if ctx.method == "OPTIONS" {
            let mut response = GatewayResponse::new(200, Value::String(String::new()));
            self.apply(&mut response);
            ctx.respond(response);
            return Ok(());
        }

        let result = next.run(ctx).await;
        if let Some(response) = ctx.response.as_mut() {
            self.apply(response);
        }
        result
    }
}

/// Per-route, per-client fixed window limiting
pub struct RateLimitMiddleware {
    routes: Arc<RouteTable>,
    limiters: Arc<RateLimiters>,
}

impl RateLimitMiddleware {
    pub fn new(routes: Arc<RouteTable>, limiters: Arc<RateLimiters>) -> Self {
        Self { routes, limiters }
    }
}

fn rate_limit_headers(
    response: &mut GatewayResponse,
    config: &RateLimitConfig,
    decision: &RateLimitDecision,
) {
    response
        .headers
        .insert("X-RateLimit-Limit".to_string(), config.requests.to_string());
    response
        .headers
        .insert("X-RateLimit-Remaining".to_string(), decision.remaining.to_string());
    response
        .headers
        .insert("X-RateLimit-Reset".to_string(), decision.reset.to_string());
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn priority(&self) -> i32 {
        RATE_LIMIT_PRIORITY
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<()> {
        let Some(route) = self.routes.find_route(&ctx.path, &ctx.method).await else {
            return next.run(ctx).await;
        };
        let limit = route.route.rate_limit;
        let path = route.route.path.clone();
        ctx.route = Some(route);

        let Some(config) = limit else {
            return next.run(ctx).await;
        };

        let limiter = self.limiters.get_or_create(&path, config);
        let decision = limiter.check_limit(&ctx.client_id);

        if !decision.allowed {
            let retry_after = decision.retry_after.unwrap_or(0);
            warn!(
                client = %ctx.client_id,
                route = %path,
                retry_after,
                "Rate limit exceeded"
            );

            let mut response = GatewayResponse::new(
                429,
                json!({ "error": "Too many requests", "retryAfter": retry_after }),
            )
            .with_header("Retry-After", retry_after.to_string());
            rate_limit_headers(&mut response, &config, &decision);
            ctx.respond(response);
            return Ok(());
        }

        let result = next.run(ctx).await;
        if let Some(response) = ctx.response.as_mut() {
            rate_limit_headers(response, &config, &decision);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records entry and exit so tests can assert nesting
    struct Probe {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<()> {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            let result = next.run(ctx).await;
            self.log.lock().unwrap().push(format!("exit {}", self.name));
            result
        }
    }

    struct Ok200;

    #[async_trait]
    impl Endpoint for Ok200 {
        async fn call(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
            ctx.respond(GatewayResponse::new(200, json!({ "ok": true })));
            Ok(())
        }
    }

    fn ctx(method: &str, path: &str) -> RequestContext {
        RequestContext::new(GatewayRequest::new(method, path))
    }

    #[tokio::test]
    async fn test_pipeline_runs_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new();
        for (name, priority) in [("c", 3), ("a", 1), ("b", 2), ("b2", 2)] {
            pipeline
                .add(Arc::new(Probe {
                    name,
                    priority,
                    log: log.clone(),
                }))
                .await;
        }

        assert_eq!(pipeline.names().await, vec!["a", "b", "b2", "c"]);

        let mut ctx = ctx("GET", "/");
        pipeline.execute(&mut ctx, &Ok200).await.unwrap();
        assert_eq!(ctx.response.unwrap().status, 200);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter a", "enter b", "enter b2", "enter c", "exit c", "exit b2", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn test_context_normalization() {
        let request = GatewayRequest::new("get", "/api/x")
            .with_header("X-Forwarded-For", "10.0.0.7, 10.0.0.1")
            .with_header("Authorization", "Bearer abc");
        let ctx = RequestContext::new(request);

        assert_eq!(ctx.method, "GET");
        assert_eq!(ctx.client_id, "10.0.0.7");
        assert_eq!(ctx.header("AUTHORIZATION"), Some("Bearer abc"));

        let ctx = RequestContext::new(GatewayRequest::new("GET", "/").with_header("X-Real-IP", "10.1.1.1"));
        assert_eq!(ctx.client_id, "10.1.1.1");
        assert_eq!(RequestContext::new(GatewayRequest::new("GET", "/")).client_id, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_cors_preflight_short_circuits() {
        let cors = CorsMiddleware::from_config(&SecurityConfig::default());
        let mut ctx = ctx("OPTIONS", "/api/projects/1");
        let chain: Vec<Arc<dyn Middleware>> = Vec::new();

        cors.handle(&mut ctx, Next::new(&chain, &Ok200)).await.unwrap();
        let response = ctx.response.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));
        assert_eq!(response.header("Access-Control-Max-Age"), Some("86400"));
    }

    #[tokio::test]
    async fn test_cors_decorates_responses() {
        let cors = CorsMiddleware::from_config(&SecurityConfig::default());
        let mut ctx = ctx("GET", "/api/projects/1");
        let chain: Vec<Arc<dyn Middleware>> = Vec::new();

        cors.handle(&mut ctx, Next::new(&chain, &Ok200)).await.unwrap();
        let response = ctx.response.unwrap();
        assert_eq!(response.body["ok"], true);
        assert_eq!(
            response.header("Access-Control-Allow-Methods"),
            Some("GET, POST, PUT, DELETE, OPTIONS")
        );
    }

    #[tokio::test]
    async fn test_auth() {
        let security = SecurityConfig {
            enable_auth: true,
            auth_tokens: vec!["s3cret-token".to_string()],
            ..Default::default()
        };
        let auth = AuthMiddleware::from_config(&security);
        let chain: Vec<Arc<dyn Middleware>> = Vec::new();

        let mut missing = ctx("GET", "/api/projects/1");
        auth.handle(&mut missing, Next::new(&chain, &Ok200)).await.unwrap();
        assert_eq!(missing.response.unwrap().status, 401);

        let mut invalid = RequestContext::new(
            GatewayRequest::new("GET", "/api/projects/1").with_header("Authorization", "Bearer nope"),
        );
        auth.handle(&mut invalid, Next::new(&chain, &Ok200)).await.unwrap();
        assert_eq!(invalid.response.unwrap().status, 401);

        let mut valid = RequestContext::new(
            GatewayRequest::new("GET", "/api/projects/1")
                .with_header("Authorization", "Bearer s3cret-token"),
        );
        auth.handle(&mut valid, Next::new(&chain, &Ok200)).await.unwrap();
        assert_eq!(valid.response.unwrap().status, 200);
        assert_eq!(valid.user.unwrap()["token"], "...oken");

        let mut skipped = ctx("POST", "/api/auth/login");
        auth.handle(&mut skipped, Next::new(&chain, &Ok200)).await.unwrap();
        assert_eq!(skipped.response.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_with_headers() {
        let routes = Arc::new(
            RouteTable::from_routes(vec![RouteConfig::new("/api/files/*", "file-service")
                .with_rate_limit(2, Duration::from_secs(60))])
            .unwrap(),
        );
        let limiter = RateLimitMiddleware::new(routes, Arc::new(RateLimiters::new()));
        let chain: Vec<Arc<dyn Middleware>> = Vec::new();

        for remaining in ["1", "0"] {
            let mut ctx = ctx("GET", "/api/files/a");
            limiter.handle(&mut ctx, Next::new(&chain, &Ok200)).await.unwrap();
            assert!(ctx.route.is_some());
            let response = ctx.response.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.header("X-RateLimit-Limit"), Some("2"));
            assert_eq!(response.header("X-RateLimit-Remaining"), Some(remaining));
        }

        let mut ctx = ctx("GET", "/api/files/a");
        limiter.handle(&mut ctx, Next::new(&chain, &Ok200)).await.unwrap();
        let response = ctx.response.unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.body["retryAfter"], 60);
        assert_eq!(response.header("Retry-After"), Some("60"));
        assert_eq!(response.header("X-RateLimit-Remaining"), Some("0"));
    }
}
