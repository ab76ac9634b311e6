//! Trace context propagation

use crate::telemetry::span::{Span, SpanContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";

const TRACE_ID_KEY: &str = "traceId";
const SPAN_ID_KEY: &str = "spanId";
const PARENT_SPAN_ID_KEY: &str = "parentSpanId";

/// Carrier formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationFormat {
    /// `x-trace-id`, `x-span-id`, `x-parent-span-id`
    HttpHeaders,
    /// `traceId`, `spanId`, `parentSpanId`
    TextMap,
}

impl PropagationFormat {
    fn keys(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            PropagationFormat::HttpHeaders => {
                (TRACE_ID_HEADER, SPAN_ID_HEADER, PARENT_SPAN_ID_HEADER)
            }
            PropagationFormat::TextMap => (TRACE_ID_KEY, SPAN_ID_KEY, PARENT_SPAN_ID_KEY),
        }
    }
}

/// Write the span's context into `carrier`. A missing parent is written as
/// an empty string.
pub fn inject(span: &Span, format: PropagationFormat, carrier: &mut HashMap<String, String>) {
    inject_context(&span.context(), format, carrier)
}

pub fn inject_context(
    context: &SpanContext,
    format: PropagationFormat,
    carrier: &mut HashMap<String, String>,
) {
    let (trace_key, span_key, parent_key) = format.keys();

    carrier.insert(trace_key.to_string(), context.trace_id.clone());
    carrier.insert(span_key.to_string(), context.span_id.clone());
    carrier.insert(
        parent_key.to_string(),
        context.parent_span_id.clone().unwrap_or_default(),
    );
}

/// Read a span context back; `None` unless both trace and span id are present
pub fn extract(format: PropagationFormat, carrier: &HashMap<String, String>) -> Option<SpanContext> {
    let (trace_key, span_key, parent_key) = format.keys();
    let lookup = |key: &str| -> Option<String> {
        let value = match format {
            // header names are case-insensitive
            PropagationFormat::HttpHeaders => carrier
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v),
            PropagationFormat::TextMap => carrier.get(key),
        };
        value.filter(|v| !v.is_empty()).cloned()
    };

    Some(SpanContext {
        trace_id: lookup(trace_key)?,
        span_id: lookup(span_key)?,
        parent_span_id: lookup(parent_key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(parent: Option<&str>) -> SpanContext {
        SpanContext {
            trace_id: "4bf92f3577b34da6".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            parent_span_id: parent.map(String::from),
        }
    }

    #[test]
    fn test_http_headers_wire_names() {
        let mut carrier = HashMap::new();
        inject_context(&context(None), PropagationFormat::HttpHeaders, &mut carrier);

        assert_eq!(carrier["x-trace-id"], "4bf92f3577b34da6");
        assert_eq!(carrier["x-span-id"], "00f067aa0ba902b7");
        assert_eq!(carrier["x-parent-span-id"], "");
    }

    #[test]
    fn test_text_map_wire_names() {
        let mut carrier = HashMap::new();
        inject_context(&context(Some("parent")), PropagationFormat::TextMap, &mut carrier);

        assert_eq!(carrier["traceId"], "4bf92f3577b34da6");
        assert_eq!(carrier["spanId"], "00f067aa0ba902b7");
        assert_eq!(carrier["parentSpanId"], "parent");

        let extracted = extract(PropagationFormat::TextMap, &carrier).unwrap();
        assert_eq!(extracted, context(Some("parent")));
    }

    #[test]
    fn test_empty_parent_extracts_as_none() {
        let mut carrier = HashMap::new();
        inject_context(&context(None), PropagationFormat::HttpHeaders, &mut carrier);
        assert_eq!(
            extract(PropagationFormat::HttpHeaders, &carrier).unwrap(),
            context(None)
        );
    }

    #[test]
    fn test_extract_requires_trace_and_span() {
        let mut carrier = HashMap::new();
        carrier.insert("x-trace-id".to_string(), "abc".to_string());
        assert!(extract(PropagationFormat::HttpHeaders, &carrier).is_none());

        carrier.insert("X-Span-Id".to_string(), "def".to_string());
        let extracted = extract(PropagationFormat::HttpHeaders, &carrier).unwrap();
        assert_eq!(extracted.span_id, "def");
    }
}
