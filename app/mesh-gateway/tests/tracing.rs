//! Tracing of gateway requests and trace export

use mesh_gateway::client::MockHttpClient;
use mesh_gateway::config::{GatewayConfig, RegistryConfig, TracingConfig};
use mesh_gateway::telemetry::{
    DistributedTracer, FinishSpanOptions, InMemoryTraceExporter, SpanKind, SpanOptions,
    SpanStatus, TraceOptions,
};
use mesh_gateway::{ApiGateway, GatewayRequest, ServiceRegistration, ServiceRegistry};
use serde_json::json;
use std::sync::Arc;

async fn traced_gateway(
    client: Arc<MockHttpClient>,
) -> (ApiGateway, Arc<DistributedTracer>, Arc<InMemoryTraceExporter>) {
    let config = GatewayConfig::default();
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default(), client.clone()).unwrap());
    let tracer = Arc::new(DistributedTracer::new(config.tracing.clone()).unwrap());
    let exporter = Arc::new(InMemoryTraceExporter::new());
    tracer.add_exporter(exporter.clone()).await;

    let gateway = ApiGateway::new(config, registry, client, Some(tracer.clone()))
        .await
        .unwrap();
    (gateway, tracer, exporter)
}

#[tokio::test]
async fn request_produces_one_complete_trace() {
    let client = Arc::new(MockHttpClient::new());
    client.respond("http://10.0.0.7:7000", 200, json!({ "done": true }));
    let (gateway, tracer, exporter) = traced_gateway(client.clone()).await;
    gateway
        .registry()
        .register_service(ServiceRegistration::new("project-service", "1.0.0", "10.0.0.7", 7000))
        .await
        .unwrap();

    let response = gateway
        .handle_request(GatewayRequest::new("GET", "/api/projects/42"))
        .await;
    assert_eq!(response.status, 200);

    let stats = tracer.get_tracing_stats().await;
    assert_eq!(stats.completed_traces, 1);
    assert_eq!(stats.active_traces, 0);

    tracer.flush().await;
    let traces = exporter.traces().await;
    assert_eq!(traces.len(), 1);

    let data = &traces[0];
    assert_eq!(data.trace.status, SpanStatus::Ok);
    assert_eq!(data.trace.operation_name, "GET /api/projects/42");
    let operations: Vec<&str> = data.spans.iter().map(|s| s.operation_name.as_str()).collect();
    assert_eq!(
        operations,
        vec!["GET /api/projects/42", "registry.discover", "forward project-service"]
    );

    let root = &data.spans[0];
    let forward = &data.spans[2];
    assert_eq!(root.kind, SpanKind::Server);
    assert_eq!(root.tags["http.status_code"], 200);
    assert_eq!(forward.kind, SpanKind::Client);
    assert_eq!(forward.parent_span_id.as_deref(), Some(root.span_id.as_str()));

    // the backend sees the forward span's context
    let sent = &client.requests().await[0];
    assert_eq!(sent.headers["x-trace-id"], data.trace.trace_id);
    assert_eq!(sent.headers["x-span-id"], forward.span_id);
    assert_eq!(sent.headers["x-parent-span-id"], root.span_id);
}

#[tokio::test]
async fn incoming_context_is_continued() {
    let (gateway, tracer, exporter) = traced_gateway(Arc::new(MockHttpClient::new())).await;

    let response = gateway
        .handle_request(
            GatewayRequest::new("GET", "/api/ai/generate")
                .with_header("X-Trace-Id", "caller-trace")
                .with_header("X-Span-Id", "caller-span"),
        )
        .await;
    assert_eq!(response.status, 503);

    tracer.flush().await;
    let traces = exporter.traces().await;
    assert_eq!(traces[0].trace.trace_id, "caller-trace");
    assert_eq!(traces[0].spans[0].parent_span_id.as_deref(), Some("caller-span"));
    assert_eq!(traces[0].trace.status, SpanStatus::Error);
    assert_eq!(traces[0].spans[0].tags["error.message"], "Service unavailable");
}

#[tokio::test]
async fn failed_forward_marks_span_error() {
    let (gateway, tracer, exporter) = traced_gateway(Arc::new(MockHttpClient::new())).await;
    gateway
        .registry()
        .register_service(ServiceRegistration::new("file-service", "1.0.0", "10.0.0.8", 7000))
        .await
        .unwrap();

    let response = gateway
        .handle_request(GatewayRequest::new("GET", "/api/files/x"))
        .await;
    assert_eq!(response.status, 502);

    tracer.flush().await;
    let data = &exporter.traces().await[0];
    let forward = data
        .spans
        .iter()
        .find(|s| s.operation_name == "forward file-service")
        .unwrap();
    assert_eq!(forward.status, SpanStatus::Error);
    assert_eq!(forward.tags["error"], true);
}

#[tokio::test]
async fn nested_spans_complete_exactly_once() {
    let tracer = DistributedTracer::new(TracingConfig::default()).unwrap();
    let exporter = Arc::new(InMemoryTraceExporter::new());
    tracer.add_exporter(exporter.clone()).await;

    let trace = tracer.start_trace("checkout", TraceOptions::default()).await;
    let root = trace.root_span_id().unwrap().to_string();
    let payment = tracer
        .create_child_span(&root, "payment", SpanOptions::default().with_service_name("payments"))
        .await
        .unwrap();
    let ledger = tracer
        .create_child_span(&payment.span_id, "ledger.write", SpanOptions::default().with_service_name("ledger"))
        .await
        .unwrap();

    for span_id in [&ledger.span_id, &root, &ledger.span_id] {
        tracer.finish_span(span_id, FinishSpanOptions::ok()).await;
    }
    assert_eq!(tracer.get_tracing_stats().await.completed_traces, 0);

    let details = tracer.get_trace_details(&trace.trace_id).await.unwrap();
    let payments = details
        .service_map
        .iter()
        .find(|n| n.service_name == "payments")
        .unwrap();
    assert_eq!(payments.connections[0].target_service, "ledger");

    tracer.finish_span(&payment.span_id, FinishSpanOptions::ok()).await;
    tracer.finish_span(&payment.span_id, FinishSpanOptions::ok()).await;
    tracer.flush().await;

    assert_eq!(exporter.len().await, 1);
    assert_eq!(tracer.get_tracing_stats().await.completed_traces, 1);
    assert!(tracer.get_trace(&trace.trace_id).await.is_none());
}
