//! HTTP server for the mesh gateway
//!
//! Admin endpoints for the gateway, registry and tracer. Every other path
//! falls through to [`ApiGateway::handle_request`].

use crate::{
    gateway::ApiGateway,
    telemetry::DistributedTracer,
    types::{GatewayRequest, GatewayResponse, ServiceRegistration},
    ServiceRegistry,
};
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router as AxumRouter,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest request body accepted by the fallback
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// HTTP server for gateway
#[derive(Clone)]
pub struct HttpServer {
    gateway: Arc<ApiGateway>,
    registry: Arc<ServiceRegistry>,
    tracer: Option<Arc<DistributedTracer>>,
}

impl HttpServer {
    /// Create new HTTP server
    pub fn new(gateway: Arc<ApiGateway>) -> Self {
        Self {
            registry: gateway.registry().clone(),
            tracer: gateway.tracer().cloned(),
            gateway,
        }
    }

    /// Create router with all endpoints
    pub fn create_router(&self) -> AxumRouter {
        AxumRouter::new()
            // Gateway endpoints
            .route("/gateway/health", get(Self::gateway_health))
            .route("/gateway/stats", get(Self::gateway_stats))
            .route("/gateway/routes", get(Self::list_routes))
            // Registry endpoints
            .route(
                "/registry/services",
                get(Self::list_services).post(Self::register_service),
            )
            .route("/registry/services/{id}", delete(Self::deregister_service))
            .route("/registry/services/{id}/heartbeat", post(Self::heartbeat))
            .route("/registry/services/{id}/health", get(Self::service_health))
            // Tracing endpoints
            .route("/tracing/stats", get(Self::tracing_stats))
            .route("/tracing/traces/{id}", get(Self::trace_details))
            // Everything else goes through the gateway
            .fallback(Self::gateway_request)
            .with_state(Arc::new(self.clone()))
    }

    /// Gateway health endpoint
    async fn gateway_health(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let info = server.gateway.info().await;
        let response = json!({
            "status": info.status,
            "gateway_id": info.gateway_id,
            "version": info.version,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (StatusCode::OK, Json(response))
    }

    /// Gateway statistics endpoint
    async fn gateway_stats(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let stats = server.gateway.get_gateway_stats().await;
        let response = json!({
            "stats": stats,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (StatusCode::OK, Json(response))
    }

    /// List routes endpoint
    async fn list_routes(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let routes = server.gateway.routes().await;
        let response = json!({
            "routes": routes,
            "count": routes.len(),
        });
        (StatusCode::OK, Json(response))
    }

    /// List registered services endpoint
    async fn list_services(State(server): State<Arc<Self>>) -> impl IntoResponse {
        let services = server.registry.get_all_services().await;
        let stats = server.registry.get_service_stats().await;
        let response = json!({
            "services": services,
            "stats": stats,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (StatusCode::OK, Json(response))
    }

    /// Register service endpoint
    async fn register_service(
        State(server): State<Arc<Self>>,
        Json(registration): Json<ServiceRegistration>,
    ) -> impl IntoResponse {
        match server.registry.register_service(registration).await {
            Ok(instance_id) => (
                StatusCode::CREATED,
                Json(json!({ "instance_id": instance_id })),
            ),
            Err(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            ),
        }
    }

    /// Deregister service endpoint
    async fn deregister_service(
        State(server): State<Arc<Self>>,
        Path(instance_id): Path<String>,
    ) -> impl IntoResponse {
        if server.registry.deregister_service(&instance_id).await {
            (StatusCode::OK, Json(json!({ "deregistered": instance_id })))
        } else {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Instance not found: {}", instance_id) })),
            )
        }
    }

    /// Heartbeat endpoint
    async fn heartbeat(
        State(server): State<Arc<Self>>,
        Path(instance_id): Path<String>,
    ) -> impl IntoResponse {
        if server.registry.heartbeat(&instance_id).await {
            (StatusCode::OK, Json(json!({ "instance_id": instance_id })))
        } else {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Instance not found: {}", instance_id) })),
            )
        }
    }

    /// Service health endpoint; the path segment is the service name
    async fn service_health(
        State(server): State<Arc<Self>>,
        Path(service_name): Path<String>,
    ) -> impl IntoResponse {
        let health = server.registry.get_service_health(&service_name).await;
        (StatusCode::OK, Json(json!(health)))
    }

    /// Tracer statistics endpoint
    async fn tracing_stats(State(server): State<Arc<Self>>) -> impl IntoResponse {
        match &server.tracer {
            Some(tracer) => (StatusCode::OK, Json(json!(tracer.get_tracing_stats().await))),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Tracing is disabled" })),
            ),
        }
    }

    /// Trace details endpoint
    async fn trace_details(
        State(server): State<Arc<Self>>,
        Path(trace_id): Path<String>,
    ) -> impl IntoResponse {
        let details = match &server.tracer {
            Some(tracer) => tracer.get_trace_details(&trace_id).await,
            None => None,
        };

        match details {
            Some(details) => (StatusCode::OK, Json(json!(details))),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Trace not found: {}", trace_id) })),
            ),
        }
    }

    /// Hand any other request to the gateway
    async fn gateway_request(State(server): State<Arc<Self>>, request: Request<Body>) -> Response {
        let gateway_request = match into_gateway_request(request).await {
            Ok(request) => request,
            Err(response) => return response,
        };

        debug!("Gateway request: {} {}", gateway_request.method, gateway_request.path);
        let response = server.gateway.handle_request(gateway_request).await;
        into_http_response(response)
    }
}

/// Convert an axum request; the peer address becomes `x-real-ip`
async fn into_gateway_request(request: Request<Body>) -> Result<GatewayRequest, Response> {
    let (parts, body) = request.into_parts();

    let mut headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        headers
            .entry("x-real-ip".to_string())
            .or_insert_with(|| peer.ip().to_string());
    }

    let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri).map_err(|e| {
        warn!("Rejected query string: {}", e);
        error_response(StatusCode::BAD_REQUEST, "Malformed query string")
    })?;

    let bytes = to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| {
        warn!("Failed to read request body: {}", e);
        error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
    })?;
    let body = if bytes.is_empty() {
        None
    } else {
        // non-JSON payloads travel as strings
        Some(
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        )
    };

    Ok(GatewayRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers,
        body,
        query,
    })
}

fn into_http_response(response: GatewayResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut http_response = (status, Json(response.body)).into_response();

    let headers = http_response.headers_mut();
    for (name, value) in response.headers {
        // the body is re-encoded, so backend framing headers no longer apply
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!("Dropping invalid response header {}", name),
        }
    }
    http_response
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
