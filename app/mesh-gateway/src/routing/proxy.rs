//! Request forwarding to backend instances

use crate::{
    client::{HttpClient, OutboundRequest},
    gateway::middleware::RequestContext,
    routing::RouteMatch,
    error::GatewayError,
    types::{GatewayResponse, ServiceInstance},
    GatewayResult,
};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hop-by-hop headers that are never forwarded
const SKIPPED_HEADERS: &[&str] = &["connection", "content-length", "transfer-encoding"];

/// Forwards gateway requests through an [`HttpClient`]
#[derive(Clone)]
pub struct Forwarder {
    client: Arc<dyn HttpClient>,
}

impl Forwarder {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }

    /// Forward to `instance`. Transport failures and timeouts are returned as
    /// errors; any HTTP status the backend answers with is a response.
    pub async fn forward(
        &self,
        instance: &ServiceInstance,
        route: &RouteMatch,
        ctx: &RequestContext,
        extra_headers: HashMap<String, String>,
        timeout: Duration,
    ) -> GatewayResult<GatewayResponse> {
        let url = target_url(instance, &route.target_path, &ctx.query)?;
        debug!("Forwarding {} {} to {}", ctx.method, ctx.path, url);

        let mut request = OutboundRequest::new(ctx.method.clone(), url, timeout);
        request.headers = forward_headers(ctx, route.route.preserve_host);
        request.headers.extend(extra_headers);
        if ctx.method != "GET" && ctx.method != "HEAD" {
            request.body = ctx.body.clone();
        }

        let response = self.client.send(request).await?;
        Ok(GatewayResponse {
            status: response.status,
            body: response.body,
            headers: response.headers,
        })
    }
}

/// `{scheme}://{host}:{port}{path}` plus the form-encoded query, pairs sorted by key
pub fn target_url(
    instance: &ServiceInstance,
    path: &str,
    query: &HashMap<String, String>,
) -> GatewayResult<String> {
    let base = format!("{}{}", instance.url(), path);
    if query.is_empty() {
        return Ok(base);
    }

    let mut url = Url::parse(&base)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid target URL {}: {}", base, e)))?;
    let mut pairs: Vec<(&String, &String)> = query.iter().collect();
    pairs.sort();
    url.query_pairs_mut().extend_pairs(pairs);
    Ok(url.into())
}

fn forward_headers(ctx: &RequestContext, preserve_host: bool) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = ctx
        .headers
        .iter()
        .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
        .filter(|(name, _)| preserve_host || name.as_str() != "host")
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    headers.remove("x-forwarded-for");
    headers.insert(
        "X-Forwarded-For".to_string(),
        ctx.header("x-forwarded-for")
            .unwrap_or(ctx.client_id.as_str())
            .to_string(),
    );
    headers.insert("X-Forwarded-Proto".to_string(), "https".to_string());
    headers.insert(
        "X-Forwarded-Host".to_string(),
        ctx.header("host").unwrap_or("localhost").to_string(),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockHttpClient;
    use crate::config::RouteConfig;
    use crate::types::{GatewayRequest, InstanceStatus, Protocol};
    use serde_json::json;

    fn instance() -> ServiceInstance {
        ServiceInstance {
            id: "projects_1".to_string(),
            name: "project-service".to_string(),
            version: "1.0.0".to_string(),
            host: "10.0.0.5".to_string(),
            port: 8081,
            protocol: Protocol::Http,
            health_check_url: None,
            status: InstanceStatus::Healthy,
            tags: Vec::new(),
            weight: 100,
            registered_at: 0,
            last_heartbeat: 0,
            metadata: HashMap::new(),
        }
    }

    fn route(path: &str) -> RouteMatch {
        let config = RouteConfig::new("/api/projects/*", "project-service")
            .with_methods(&["GET", "POST"])
            .with_strip_path(true);
        RouteMatch::new(Arc::new(config), path)
    }

    #[tokio::test]
    async fn test_forward_builds_url_and_headers() {
        let client = Arc::new(MockHttpClient::new());
        client.respond("http://10.0.0.5:8081", 201, json!({ "id": 7 }));
        let forwarder = Forwarder::new(client.clone());

        let mut request = GatewayRequest::new("POST", "/api/projects/new")
            .with_header("Host", "gateway.local")
            .with_header("Content-Length", "12")
            .with_body(json!({ "name": "demo" }));
        request.query.insert("draft".to_string(), "true".to_string());
        let ctx = RequestContext::new(request);

        let response = forwarder
            .forward(
                &instance(),
                &route(&ctx.path),
                &ctx,
                HashMap::from([("x-trace-id".to_string(), "t1".to_string())]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body["id"], 7);

        let sent = &client.requests().await[0];
        assert_eq!(sent.url, "http://10.0.0.5:8081/new?draft=true");
        assert_eq!(sent.body, Some(json!({ "name": "demo" })));
        assert_eq!(sent.headers["X-Forwarded-For"], "127.0.0.1");
        assert_eq!(sent.headers["X-Forwarded-Host"], "gateway.local");
        assert_eq!(sent.headers["X-Forwarded-Proto"], "https");
        assert_eq!(sent.headers["x-trace-id"], "t1");
        assert!(!sent.headers.contains_key("host"));
        assert!(!sent.headers.contains_key("content-length"));
    }

    #[test]
    fn test_query_values_are_encoded() {
        let query = HashMap::from([
            ("q".to_string(), "a&admin=true".to_string()),
            ("flag".to_string(), String::new()),
            ("name".to_string(), "two words".to_string()),
        ]);

        let url = target_url(&instance(), "/search", &query).unwrap();
        assert_eq!(
            url,
            "http://10.0.0.5:8081/search?flag=&name=two+words&q=a%26admin%3Dtrue"
        );
    }

    #[tokio::test]
    async fn test_get_drops_body() {
        let client = Arc::new(MockHttpClient::new());
        client.respond("http://10.0.0.5:8081", 200, json!([]));
        let forwarder = Forwarder::new(client.clone());

        let ctx = RequestContext::new(
            GatewayRequest::new("GET", "/api/projects/list").with_body(json!({ "ignored": true })),
        );
        forwarder
            .forward(&instance(), &route(&ctx.path), &ctx, HashMap::new(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(client.requests().await[0].body, None);
    }

    #[tokio::test]
    async fn test_transport_failure_is_error() {
        let client = Arc::new(MockHttpClient::new());
        let forwarder = Forwarder::new(client);
        let ctx = RequestContext::new(GatewayRequest::new("GET", "/api/projects/list"));

        let result = forwarder
            .forward(&instance(), &route(&ctx.path), &ctx, HashMap::new(), Duration::from_secs(5))
            .await;
        assert!(result.unwrap_err().is_transient());
    }
}
