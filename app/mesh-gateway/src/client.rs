//! Outbound HTTP capability
//!
//! Health probes, forwarded gateway calls and trace exporters all go through
//! [`HttpClient`], so tests can swap the network for a scripted fake.

use crate::{error::GatewayError, GatewayResult};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// A request leaving the control plane
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout,
        }
    }

    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self::new("GET", url, timeout)
    }

    pub fn post(url: impl Into<String>, body: Value, timeout: Duration) -> Self {
        Self::new("POST", url, timeout).with_body(body)
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

/// Response to an [`OutboundRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl OutboundResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Capability to perform HTTP calls under a deadline
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request. Transport failures and elapsed deadlines are errors,
    /// any HTTP status (including 5xx) is a response.
    async fn send(&self, request: OutboundRequest) -> GatewayResult<OutboundResponse>;
}

/// [`HttpClient`] backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> GatewayResult<Self> {
        let client = Client::builder()
            .user_agent(format!("{}/{}", crate::GATEWAY_NAME, crate::GATEWAY_VERSION))
            .build()?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: OutboundRequest) -> GatewayResult<OutboundResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid method {}: {}", request.method, e)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!("{} {}", request.method, request.url);

        let call = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let text = response.text().await?;
            let body = if text.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };

            Ok::<_, GatewayError>(OutboundResponse {
                status,
                headers,
                body,
            })
        };

        timeout(request.timeout, call).await.map_err(|_| {
            GatewayError::Timeout(format!(
                "{} {} timed out after {:?}",
                request.method, request.url, request.timeout
            ))
        })?
    }
}

/// Scripted behaviour for a URL prefix in [`MockHttpClient`]
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Answer with a fixed response
    Respond(OutboundResponse),
    /// Fail with a network error
    Fail(String),
    /// Wait out the request deadline, then fail with a timeout
    Hang,
}

/// In-process [`HttpClient`] with scripted responses, for tests and local runs
#[derive(Debug, Default)]
pub struct MockHttpClient {
    behaviors: dashmap::DashMap<String, MockBehavior>,
    requests: tokio::sync::Mutex<Vec<OutboundRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour for every URL starting with `prefix`
    pub fn on(&self, prefix: impl Into<String>, behavior: MockBehavior) -> &Self {
        self.behaviors.insert(prefix.into(), behavior);
        self
    }

    /// Shorthand for a fixed status with a JSON body
    pub fn respond(&self, prefix: impl Into<String>, status: u16, body: Value) -> &Self {
        self.on(prefix, MockBehavior::Respond(OutboundResponse::new(status, body)))
    }

    /// Every request seen so far
    pub async fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().await.clone()
    }

    /// Number of requests whose URL starts with `prefix`
    pub async fn call_count(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|r| r.url.starts_with(prefix))
            .count()
    }

    fn behavior_for(&self, url: &str) -> Option<MockBehavior> {
        self.behaviors
            .iter()
            .filter(|entry| url.starts_with(entry.key().as_str()))
            .max_by_key(|entry| entry.key().len())
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: OutboundRequest) -> GatewayResult<OutboundResponse> {
        self.requests.lock().await.push(request.clone());

        match self.behavior_for(&request.url) {
            Some(MockBehavior::Respond(response)) => Ok(response),
            Some(MockBehavior::Fail(reason)) => Err(GatewayError::Network(reason)),
            Some(MockBehavior::Hang) => {
                tokio::time::sleep(request.timeout).await;
                Err(GatewayError::Timeout(format!(
                    "{} timed out after {:?}",
                    request.url, request.timeout
                )))
            }
            None => Err(GatewayError::Network(format!(
                "connection refused: {}",
                request.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_prefers_longest_prefix() {
        let client = MockHttpClient::new();
        client
            .respond("http://svc", 200, Value::Null)
            .respond("http://svc/health", 503, Value::Null);

        let health = client
            .send(OutboundRequest::get("http://svc/health", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(health.status, 503);

        let other = client
            .send(OutboundRequest::get("http://svc/users", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(other.status, 200);

        assert!(client
            .send(OutboundRequest::get("http://elsewhere", Duration::from_secs(1)))
            .await
            .is_err());
        assert_eq!(client.call_count("http://svc").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_hang_times_out() {
        let client = MockHttpClient::new();
        client.on("http://slow", MockBehavior::Hang);

        let err = client
            .send(OutboundRequest::get("http://slow/x", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
    }

    #[test]
    fn test_outbound_request_builders() {
        let request = OutboundRequest::post(
            "http://collector/api/traces",
            serde_json::json!({"data": []}),
            Duration::from_secs(10),
        )
        .with_header("content-type", "application/json");

        assert_eq!(request.method, "POST");
        assert!(request.body.is_some());
        assert_eq!(request.headers["content-type"], "application/json");
    }

    #[test]
    fn test_success_range() {
        assert!(OutboundResponse::new(200, Value::Null).is_success());
        assert!(OutboundResponse::new(204, Value::Null).is_success());
        assert!(!OutboundResponse::new(500, Value::Null).is_success());
        assert!(!OutboundResponse::new(301, Value::Null).is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let client = ReqwestHttpClient::new().unwrap();
        let result = client
            .send(OutboundRequest::get(
                "http://127.0.0.1:1/health",
                Duration::from_secs(2),
            ))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_transient());
    }
}
