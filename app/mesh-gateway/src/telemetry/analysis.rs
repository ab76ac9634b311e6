//! Trace analysis: timeline, service map and critical path
//!
//! All functions are pure over a slice of spans from one trace.

use crate::telemetry::span::{Span, SpanLog, SpanStatus, Trace};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    SpanStart,
    SpanEnd,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    pub timestamp: u64,
    pub span_id: String,
    pub operation_name: String,
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<SpanLog>,
}

/// Caller to callee edge in the service map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConnection {
    pub target_service: String,
    pub call_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMapNode {
    pub service_name: String,
    pub span_count: u64,
    pub error_count: u64,
    pub total_duration: u64,
    /// Services this one called
    pub connections: Vec<ServiceConnection>,
}

/// Full breakdown of one trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDetails {
    pub trace: Trace,
    pub spans: Vec<Span>,
    pub timeline: Vec<TimelineEvent>,
    pub service_map: Vec<ServiceMapNode>,
    pub critical_path: Vec<Span>,
}

impl TraceDetails {
    pub fn new(trace: Trace, spans: Vec<Span>) -> Self {
        Self {
            timeline: build_timeline(&spans),
            service_map: build_service_map(&spans),
            critical_path: find_critical_path(&spans),
            trace,
            spans,
        }
    }
}

/// Span starts, ends and logs in chronological order
pub fn build_timeline(spans: &[Span]) -> Vec<TimelineEvent> {
    let mut events = Vec::new();

    for span in spans {
        let event = |event_type: TimelineEventType, timestamp: u64, data: Option<SpanLog>| TimelineEvent {
            event_type,
            timestamp,
            span_id: span.span_id.clone(),
            operation_name: span.operation_name.clone(),
            service_name: span.service_name.clone(),
            data,
        };

        events.push(event(TimelineEventType::SpanStart, span.start_time, None));
        if let Some(end_time) = span.end_time {
            events.push(event(TimelineEventType::SpanEnd, end_time, None));
        }
        for log in &span.logs {
            events.push(event(TimelineEventType::Log, log.timestamp, Some(log.clone())));
        }
    }

    // stable, so equal timestamps keep span order
    events.sort_by_key(|e| e.timestamp);
    events
}

/// Per-service span and error counts with caller to callee edges
pub fn build_service_map(spans: &[Span]) -> Vec<ServiceMapNode> {
    let by_id: HashMap<&str, &Span> = spans.iter().map(|s| (s.span_id.as_str(), s)).collect();
    let mut nodes: Vec<ServiceMapNode> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut node_for = |service: &str, nodes: &mut Vec<ServiceMapNode>| -> usize {
        *index.entry(service.to_string()).or_insert_with(|| {
            nodes.push(ServiceMapNode {
                service_name: service.to_string(),
                span_count: 0,
                error_count: 0,
                total_duration: 0,
                connections: Vec::new(),
            });
            nodes.len() - 1
        })
    };

    for span in spans {
        let i = node_for(&span.service_name, &mut nodes);
        let node = &mut nodes[i];
        node.span_count += 1;
        node.total_duration += span.duration.unwrap_or(0);
        if span.status == SpanStatus::Error {
            node.error_count += 1;
        }

        let Some(parent) = span
            .parent_span_id
            .as_deref()
            .and_then(|id| by_id.get(id))
        else {
            continue;
        };
        if parent.service_name == span.service_name {
            continue;
        }

        let caller = node_for(&parent.service_name, &mut nodes);
        let connections = &mut nodes[caller].connections;
        match connections
            .iter_mut()
            .find(|c| c.target_service == span.service_name)
        {
            Some(connection) => connection.call_count += 1,
            None => connections.push(ServiceConnection {
                target_service: span.service_name.clone(),
                call_count: 1,
            }),
        }
    }

    nodes
}

/// Approximate critical path.
///
/// From each root the walk greedily descends into the child with the largest
/// duration; the root whose walk has the largest summed duration wins. This
/// is a heuristic, not an exact longest path over the span tree. Spans whose
/// parent is not part of `spans` (remote parents) count as roots.
pub fn find_critical_path(spans: &[Span]) -> Vec<Span> {
    let ids: HashSet<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();
    let mut children: HashMap<&str, Vec<&Span>> = HashMap::new();
    let mut roots = Vec::new();

    for span in spans {
        match span.parent_span_id.as_deref() {
            Some(parent) if ids.contains(parent) => children.entry(parent).or_default().push(span),
            _ => roots.push(span),
        }
    }

    let mut best: Vec<Span> = Vec::new();
    let mut best_duration = 0;

    for root in roots {
        let mut path = vec![root.clone()];
        let mut visited: HashSet<&str> = HashSet::from([root.span_id.as_str()]);
        let mut current = root;

        while let Some(next) = children.get(current.span_id.as_str()).and_then(|c| {
            // first of equal durations wins
            c.iter()
                .copied()
                .reduce(|a, b| if b.duration.unwrap_or(0) > a.duration.unwrap_or(0) { b } else { a })
        }) {
            if !visited.insert(next.span_id.as_str()) {
                break;
            }
            path.push(next.clone());
            current = next;
        }

        let duration: u64 = path.iter().map(|s| s.duration.unwrap_or(0)).sum();
        if best.is_empty() || duration > best_duration {
            best_duration = duration;
            best = path;
        }
    }

    best
}
