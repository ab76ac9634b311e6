//! Trace and span data model

use crate::types::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Status of a span or trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Active,
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Client,
    Server,
    Producer,
    Consumer,
    #[default]
    Internal,
}

impl SpanKind {
    pub fn as_upper(&self) -> &'static str {
        match self {
            SpanKind::Client => "CLIENT",
            SpanKind::Server => "SERVER",
            SpanKind::Producer => "PRODUCER",
            SpanKind::Consumer => "CONSUMER",
            SpanKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    ChildOf,
    FollowsFrom,
}

/// Causal link to another span
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanReference {
    #[serde(rename = "type")]
    pub ref_type: ReferenceType,
    pub span_id: String,
}

impl SpanReference {
    pub fn child_of(span_id: impl Into<String>) -> Self {
        Self {
            ref_type: ReferenceType::ChildOf,
            span_id: span_id.into(),
        }
    }

    pub fn follows_from(span_id: impl Into<String>) -> Self {
        Self {
            ref_type: ReferenceType::FollowsFrom,
            span_id: span_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Timestamped event attached to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLog {
    /// ms since epoch
    pub timestamp: u64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
}

impl SpanLog {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp_ms(),
            message: Some(message.into()),
            level: None,
            fields: HashMap::new(),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A single timed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub duration: Option<u64>,
    pub status: SpanStatus,
    pub tags: HashMap<String, Value>,
    pub logs: Vec<SpanLog>,
    pub references: Vec<SpanReference>,
    pub service_name: String,
    pub kind: SpanKind,
}

impl Span {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
        }
    }
}

/// Tree of spans for one end-to-end request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub operation_name: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub duration: Option<u64>,
    pub status: SpanStatus,
    /// Span ids in creation order, the root first
    pub spans: Vec<String>,
    pub tags: HashMap<String, Value>,
    pub baggage: HashMap<String, String>,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
}

impl Trace {
    pub fn root_span_id(&self) -> Option<&str> {
        self.spans.first().map(String::as_str)
    }
}

/// Identifiers that cross process boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub tags: HashMap<String, Value>,
    pub baggage: HashMap<String, String>,
    pub kind: SpanKind,
    /// Remote caller context; the new trace continues its trace id
    pub parent: Option<SpanContext>,
}

impl TraceOptions {
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_parent(mut self, parent: Option<SpanContext>) -> Self {
        self.parent = parent;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    pub trace_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub tags: HashMap<String, Value>,
    pub references: Vec<SpanReference>,
    pub kind: SpanKind,
    /// Overrides the tracer's service name
    pub service_name: Option<String>,
}

impl SpanOptions {
    pub fn child_of(parent_span_id: impl Into<String>) -> Self {
        Self {
            parent_span_id: Some(parent_span_id.into()),
            ..Default::default()
        }
    }

    pub fn in_trace(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FinishSpanOptions {
    pub status: Option<SpanStatus>,
    /// Marks the span as failed with this message
    pub error: Option<String>,
    pub tags: HashMap<String, Value>,
    pub logs: Vec<SpanLog>,
}

impl FinishSpanOptions {
    pub fn ok() -> Self {
        Self {
            status: Some(SpanStatus::Ok),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_log(mut self, log: SpanLog) -> Self {
        self.logs.push(log);
        self
    }
}

/// A finished trace with its spans, as handed to exporters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub trace: Trace,
    pub spans: Vec<Span>,
    pub timestamp: u64,
}
