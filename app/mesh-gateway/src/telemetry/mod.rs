//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Distributed tracing: spans, propagation, analysis and export

pub mod analysis;
pub mod exporters;
pub mod propagation;
pub mod span;
pub mod tracer;

// Re-export main types
pub use analysis::{TimelineEvent, TraceDetails};
pub use exporters::{
    ConsoleTraceExporter, InMemoryTraceExporter, JaegerTraceExporter, TraceExporter,
    ZipkinTraceExporter,
};
pub use propagation::{extract, inject, inject_context, PropagationFormat};
pub use span::{
    FinishSpanOptions, Span, SpanContext, SpanKind, SpanLog, SpanOptions, SpanStatus, Trace,
    TraceData, TraceOptions,
};
pub use tracer::{DistributedTracer, TraceQuery, TracingStats};
