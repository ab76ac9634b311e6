//! Trace exporters

use crate::{
    client::{HttpClient, OutboundRequest},
    error::GatewayError,
    telemetry::span::{Span, TraceData},
    GatewayResult,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Sink for finished traces
#[async_trait]
pub trait TraceExporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, data: &TraceData) -> GatewayResult<()>;
}

/// Logs a one-line summary per trace
#[derive(Debug, Default)]
pub struct ConsoleTraceExporter;

#[async_trait]
impl TraceExporter for ConsoleTraceExporter {
    fn name(&self) -> &str {
        "console"
    }

    async fn export(&self, data: &TraceData) -> GatewayResult<()> {
        info!(
            trace_id = %data.trace.trace_id,
            operation = %data.trace.operation_name,
            duration_ms = data.trace.duration.unwrap_or(0),
            spans = data.spans.len(),
            status = ?data.trace.status,
            "Trace completed"
        );
        Ok(())
    }
}

/// Keeps exported traces in memory
#[derive(Debug, Default)]
pub struct InMemoryTraceExporter {
    traces: Mutex<Vec<TraceData>>,
}

impl InMemoryTraceExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn traces(&self) -> Vec<TraceData> {
        self.traces.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.traces.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.traces.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.traces.lock().await.clear();
    }
}

#[async_trait]
impl TraceExporter for InMemoryTraceExporter {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn export(&self, data: &TraceData) -> GatewayResult<()> {
        self.traces.lock().await.push(data.clone());
        Ok(())
    }
}

/// Posts traces to a Jaeger collector at `{endpoint}/api/traces`
pub struct JaegerTraceExporter {
    endpoint: String,
    client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl JaegerTraceExporter {
    pub fn new(endpoint: impl Into<String>, client: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
            timeout,
        }
    }

    /// Jaeger JSON; timestamps in microseconds
    pub fn convert(data: &TraceData) -> Value {
        let spans: Vec<Value> = data
            .spans
            .iter()
            .map(|span| {
                let tags: Vec<Value> = span
                    .tags
                    .iter()
                    .map(|(key, value)| {
                        json!({
                            "key": key,
                            "type": jaeger_type(value),
                            "value": value_to_string(value),
                        })
                    })
                    .collect();

                let logs: Vec<Value> = span
                    .logs
                    .iter()
                    .map(|log| {
                        let mut fields: Vec<Value> = log
                            .fields
                            .iter()
                            .map(|(key, value)| json!({ "key": key, "value": value_to_string(value) }))
                            .collect();
                        if let Some(message) = &log.message {
                            fields.push(json!({ "key": "message", "value": message }));
                        }
                        json!({ "timestamp": log.timestamp * 1000, "fields": fields })
                    })
                    .collect();

                json!({
                    "traceID": span.trace_id,
                    "spanID": span.span_id,
                    "parentSpanID": span.parent_span_id,
                    "operationName": span.operation_name,
                    "startTime": span.start_time * 1000,
                    "duration": span.duration.unwrap_or(0) * 1000,
                    "tags": tags,
                    "logs": logs,
                    "process": { "serviceName": span.service_name, "tags": [] },
                })
            })
            .collect();

        json!({ "traceID": data.trace.trace_id, "spans": spans })
    }
}

#[async_trait]
impl TraceExporter for JaegerTraceExporter {
    fn name(&self) -> &str {
        "jaeger"
    }

    async fn export(&self, data: &TraceData) -> GatewayResult<()> {
        let url = format!("{}/api/traces", self.endpoint);
        post(self.client.as_ref(), url, Self::convert(data), self.timeout).await
    }
}

/// Posts spans to a Zipkin collector at `{endpoint}/api/v2/spans`
pub struct ZipkinTraceExporter {
    endpoint: String,
    client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl ZipkinTraceExporter {
    pub fn new(endpoint: impl Into<String>, client: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
            timeout,
        }
    }

    /// Zipkin v2 JSON; timestamps in microseconds
    pub fn convert(data: &TraceData) -> Value {
        Value::Array(data.spans.iter().map(zipkin_span).collect())
    }
}

fn zipkin_span(span: &Span) -> Value {
    let tags: serde_json::Map<String, Value> = span
        .tags
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value_to_string(value))))
        .collect();

    let annotations: Vec<Value> = span
        .logs
        .iter()
        .map(|log| {
            let value = match &log.message {
                Some(message) => message.clone(),
                None => serde_json::to_string(&log.fields).unwrap_or_default(),
            };
            json!({ "timestamp": log.timestamp * 1000, "value": value })
        })
        .collect();

    let mut value = json!({
        "traceId": span.trace_id,
        "id": span.span_id,
        "name": span.operation_name,
        "timestamp": span.start_time * 1000,
        "duration": span.duration.unwrap_or(0) * 1000,
        "kind": span.kind.as_upper(),
        "localEndpoint": { "serviceName": span.service_name },
        "tags": tags,
        "annotations": annotations,
    });
    if let (Some(parent), Some(object)) = (&span.parent_span_id, value.as_object_mut()) {
        object.insert("parentId".to_string(), Value::String(parent.clone()));
    }
    value
}

#[async_trait]
impl TraceExporter for ZipkinTraceExporter {
    fn name(&self) -> &str {
        "zipkin"
    }

    async fn export(&self, data: &TraceData) -> GatewayResult<()> {
        let url = format!("{}/api/v2/spans", self.endpoint);
        post(self.client.as_ref(), url, Self::convert(data), self.timeout).await
    }
}

async fn post(client: &dyn HttpClient, url: String, body: Value, timeout: Duration) -> GatewayResult<()> {
    let request =
        OutboundRequest::post(url.clone(), body, timeout).with_header("Content-Type", "application/json");
    let response = client.send(request).await?;

    if !response.is_success() {
        return Err(GatewayError::Tracing(format!(
            "Collector {} answered {}",
            url, response.status
        )));
    }
    Ok(())
}

fn jaeger_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float64",
        Value::Number(_) => "int64",
        _ => "string",
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockHttpClient;
    use crate::telemetry::span::{SpanKind, SpanLog, SpanStatus, Trace};
    use std::collections::HashMap;

    fn trace_data() -> TraceData {
        let mut tags = HashMap::new();
        tags.insert("http.status_code".to_string(), json!(200));

        let root = Span {
            span_id: "root".to_string(),
            trace_id: "trace-1".to_string(),
            parent_span_id: None,
            operation_name: "GET /api/ai/generate".to_string(),
            start_time: 1_000,
            end_time: Some(1_250),
            duration: Some(250),
            status: SpanStatus::Ok,
            tags,
            logs: vec![SpanLog::new("routed").at(1_010)],
            references: Vec::new(),
            service_name: "mesh-gateway".to_string(),
            kind: SpanKind::Server,
        };
        let mut child = root.clone();
        child.span_id = "child".to_string();
        child.parent_span_id = Some("root".to_string());
        child.kind = SpanKind::Client;
        child.logs.clear();

        TraceData {
            trace: Trace {
                trace_id: "trace-1".to_string(),
                operation_name: "GET /api/ai/generate".to_string(),
                start_time: 1_000,
                end_time: Some(1_250),
                duration: Some(250),
                status: SpanStatus::Ok,
                spans: vec!["root".to_string(), "child".to_string()],
                tags: HashMap::new(),
                baggage: HashMap::new(),
                service_name: "mesh-gateway".to_string(),
                service_version: "0.1.0".to_string(),
                environment: "test".to_string(),
            },
            spans: vec![root, child],
            timestamp: 1_300,
        }
    }

    #[test]
    fn test_jaeger_uses_microseconds() {
        let jaeger = JaegerTraceExporter::convert(&trace_data());
        let span = &jaeger["spans"][0];
        assert_eq!(jaeger["traceID"], "trace-1");
        assert_eq!(span["startTime"], 1_000_000);
        assert_eq!(span["duration"], 250_000);
        assert_eq!(span["tags"][0]["type"], "int64");
        assert_eq!(span["tags"][0]["value"], "200");
        assert_eq!(span["logs"][0]["timestamp"], 1_010_000);
        assert_eq!(span["process"]["serviceName"], "mesh-gateway");
    }

    #[test]
    fn test_zipkin_format() {
        let zipkin = ZipkinTraceExporter::convert(&trace_data());
        assert_eq!(zipkin[0]["id"], "root");
        assert!(zipkin[0].get("parentId").is_none());
        assert_eq!(zipkin[1]["parentId"], "root");
        assert_eq!(zipkin[1]["kind"], "CLIENT");
        assert_eq!(zipkin[0]["tags"]["http.status_code"], "200");
        assert_eq!(zipkin[0]["annotations"][0]["value"], "routed");
    }

    #[tokio::test]
    async fn test_jaeger_posts_to_collector() {
        let client = Arc::new(MockHttpClient::new());
        client.respond("http://jaeger:14268/api/traces", 202, Value::Null);

        let exporter =
            JaegerTraceExporter::new("http://jaeger:14268/", client.clone(), Duration::from_secs(1));
        exporter.export(&trace_data()).await.unwrap();

        let requests = client.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].url, "http://jaeger:14268/api/traces");
    }

    #[tokio::test]
    async fn test_collector_error_is_reported() {
        let client = Arc::new(MockHttpClient::new());
        client.respond("http://zipkin:9411", 500, Value::Null);

        let exporter = ZipkinTraceExporter::new("http://zipkin:9411", client, Duration::from_secs(1));
        let err = exporter.export(&trace_data()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Tracing(_)));
    }
}
