//! Distributed tracer
//!
//! Live traces are held per trace behind their own lock, so finishing spans
//! in different traces never contends. A trace completes exactly once, when
//! its last open span finishes; it is then purged from memory, sampled, and
//! queued for the export worker.

use crate::{
    client::HttpClient,
    config::TracingConfig,
    error::GatewayError,
    telemetry::{
        analysis::TraceDetails,
        exporters::{ConsoleTraceExporter, JaegerTraceExporter, TraceExporter, ZipkinTraceExporter},
        span::{
            FinishSpanOptions, Span, SpanLog, SpanOptions, SpanReference, SpanStatus, Trace,
            TraceData, TraceOptions,
        },
    },
    types::{current_timestamp_ms, generate_short_id},
    GatewayResult,
};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Live trace state
#[derive(Debug)]
struct TraceRecord {
    trace: Trace,
    spans: HashMap<String, Span>,
    completed: bool,
    opened: Instant,
}

impl TraceRecord {
    fn all_finished(&self) -> bool {
        self.trace
            .spans
            .iter()
            .all(|id| self.spans.get(id).map(Span::is_finished).unwrap_or(true))
    }

    /// Seal the trace; must only be called once
    fn complete(&mut self, now: u64) -> TraceData {
        self.completed = true;
        self.trace.end_time = Some(now);
        self.trace.duration = Some(now.saturating_sub(self.trace.start_time));

        let has_errors = self.spans.values().any(|s| s.status == SpanStatus::Error);
        self.trace.status = if has_errors {
            SpanStatus::Error
        } else {
            SpanStatus::Ok
        };

        TraceData {
            trace: self.trace.clone(),
            spans: self.ordered_spans(),
            timestamp: now,
        }
    }

    fn ordered_spans(&self) -> Vec<Span> {
        self.trace
            .spans
            .iter()
            .filter_map(|id| self.spans.get(id).cloned())
            .collect()
    }
}

/// Filters for [`DistributedTracer::search_traces`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceQuery {
    #[serde(default)]
    pub service_name: Option<String>,
    /// Substring of the operation name
    #[serde(default)]
    pub operation_name: Option<String>,
    /// Start time window (ms since epoch), applied when both are set
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub min_duration: Option<u64>,
    #[serde(default)]
    pub max_duration: Option<u64>,
    #[serde(default)]
    pub status: Option<SpanStatus>,
    #[serde(default)]
    pub tags: HashMap<String, Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub const DEFAULT_SEARCH_LIMIT: usize = 100;

impl TraceQuery {
    fn matches(&self, trace: &Trace) -> bool {
        if let Some(service) = &self.service_name {
            if &trace.service_name != service {
                return false;
            }
        }
        if let Some(operation) = &self.operation_name {
            if !trace.operation_name.contains(operation.as_str()) {
                return false;
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if trace.start_time < start || trace.start_time > end {
                return false;
            }
        }

        let duration = trace.duration.unwrap_or(0);
        if matches!(self.min_duration, Some(min) if duration < min) {
            return false;
        }
        if matches!(self.max_duration, Some(max) if duration > max) {
            return false;
        }
        if matches!(self.status, Some(status) if trace.status != status) {
            return false;
        }

        self.tags
            .iter()
            .all(|(key, value)| trace.tags.get(key) == Some(value))
    }
}

/// Tracer statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingStats {
    pub active_traces: usize,
    pub completed_traces: u64,
    pub exported_traces: u64,
    pub dropped_traces: u64,
    pub error_traces: u64,
    pub export_failures: u64,
    pub pending_exports: usize,
    pub total_spans: usize,
    /// Mean duration of completed traces (ms)
    pub average_trace_duration: f64,
    pub error_rate: f64,
    pub sampling_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    exported: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    export_failures: AtomicU64,
    total_duration: AtomicU64,
}

/// Span and trace engine
pub struct DistributedTracer {
    config: TracingConfig,
    traces: DashMap<String, Arc<Mutex<TraceRecord>>>,
    span_index: DashMap<String, String>,
    exporters: RwLock<Vec<Arc<dyn TraceExporter>>>,
    pending: Mutex<VecDeque<TraceData>>,
    export_lock: Mutex<()>,
    export_ready: Arc<Notify>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl DistributedTracer {
    /// Create a tracer without exporters
    pub fn new(config: TracingConfig) -> GatewayResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            traces: DashMap::new(),
            span_index: DashMap::new(),
            exporters: RwLock::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            export_lock: Mutex::new(()),
            export_ready: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            worker: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Create a tracer with the exporters enabled in `config`
    pub async fn with_configured_exporters(
        config: TracingConfig,
        client: Arc<dyn HttpClient>,
    ) -> GatewayResult<Self> {
        let tracer = Self::new(config.clone())?;

        if config.console_exporter {
            tracer.add_exporter(Arc::new(ConsoleTraceExporter)).await;
        }
        if let Some(endpoint) = &config.jaeger_endpoint {
            tracer
                .add_exporter(Arc::new(JaegerTraceExporter::new(
                    endpoint.clone(),
                    client.clone(),
                    config.exporter_timeout,
                )))
                .await;
        }
        if let Some(endpoint) = &config.zipkin_endpoint {
            tracer
                .add_exporter(Arc::new(ZipkinTraceExporter::new(
                    endpoint.clone(),
                    client,
                    config.exporter_timeout,
                )))
                .await;
        }

        Ok(tracer)
    }

    pub fn config(&self) -> &TracingConfig {
        &self.config
    }

    pub async fn add_exporter(&self, exporter: Arc<dyn TraceExporter>) {
        info!("Added trace exporter: {}", exporter.name());
        self.exporters.write().await.push(exporter);
    }

    /// Start a trace and its root span. A remote parent's trace id is
    /// continued unless a live trace already owns it.
    pub async fn start_trace(&self, operation_name: &str, options: TraceOptions) -> Trace {
        let mut trace_id = match &options.parent {
            Some(parent) => parent.trace_id.clone(),
            None => generate_short_id(),
        };

        // claim the id under the map entry lock
        let trace = loop {
            match self.traces.entry(trace_id.clone()) {
                Entry::Vacant(slot) => {
                    let record = self.new_record(&trace_id, operation_name, &options);
                    let trace = record.trace.clone();
                    slot.insert(Arc::new(Mutex::new(record)));
                    break trace;
                }
                Entry::Occupied(_) => {
                    debug!("Trace id {} is already live, starting a fresh one", trace_id);
                    trace_id = generate_short_id();
                }
            }
        };

        if let Some(root_span_id) = trace.root_span_id() {
            self.span_index
                .insert(root_span_id.to_string(), trace_id.clone());
        }

        debug!("Started trace {} ({})", trace_id, operation_name);
        trace
    }

    fn new_record(&self, trace_id: &str, operation_name: &str, options: &TraceOptions) -> TraceRecord {
        let now = current_timestamp_ms();
        let root_span_id = generate_short_id();
        let remote_parent = options.parent.as_ref().map(|p| p.span_id.clone());

        let root = Span {
            span_id: root_span_id.clone(),
            trace_id: trace_id.to_string(),
            parent_span_id: remote_parent.clone(),
            operation_name: operation_name.to_string(),
            start_time: now,
            end_time: None,
            duration: None,
            status: SpanStatus::Active,
            tags: HashMap::new(),
            logs: Vec::new(),
            references: remote_parent.into_iter().map(SpanReference::child_of).collect(),
            service_name: self.config.service_name.clone(),
            kind: options.kind,
        };

        let trace = Trace {
            trace_id: trace_id.to_string(),
            operation_name: operation_name.to_string(),
            start_time: now,
            end_time: None,
            duration: None,
            status: SpanStatus::Active,
            spans: vec![root_span_id.clone()],
            tags: options.tags.clone(),
            baggage: options.baggage.clone(),
            service_name: self.config.service_name.clone(),
            service_version: self.config.service_version.clone(),
            environment: self.config.environment.clone(),
        };

        TraceRecord {
            trace,
            spans: HashMap::from([(root_span_id, root)]),
            completed: false,
            opened: Instant::now(),
        }
    }

    /// Start a span. With a parent the span joins the parent's trace; with
    /// only a trace id it joins that trace; with neither it roots a new trace.
    pub async fn start_span(&self, operation_name: &str, options: SpanOptions) -> GatewayResult<Span> {
        let trace_id = match (&options.parent_span_id, &options.trace_id) {
            (Some(parent), _) => self
                .span_index
                .get(parent)
                .map(|t| t.value().clone())
                .ok_or_else(|| GatewayError::Tracing(format!("Parent span not found: {}", parent)))?,
            (None, Some(trace_id)) => trace_id.clone(),
            (None, None) => {
                let trace = self
                    .start_trace(
                        operation_name,
                        TraceOptions {
                            tags: options.tags,
                            kind: options.kind,
                            ..Default::default()
                        },
                    )
                    .await;
                return self.root_span(&trace).await;
            }
        };

        let record = self
            .record(&trace_id)
            .ok_or_else(|| GatewayError::Tracing(format!("Trace not found: {}", trace_id)))?;

        let span_id = generate_short_id();
        let mut references = options.references;
        if let Some(parent) = &options.parent_span_id {
            references.push(SpanReference::child_of(parent.clone()));
        }

        let span = Span {
            span_id: span_id.clone(),
            trace_id: trace_id.clone(),
            parent_span_id: options.parent_span_id,
            operation_name: operation_name.to_string(),
            start_time: current_timestamp_ms(),
            end_time: None,
            duration: None,
            status: SpanStatus::Active,
            tags: options.tags,
            logs: Vec::new(),
            references,
            service_name: options
                .service_name
                .unwrap_or_else(|| self.config.service_name.clone()),
            kind: options.kind,
        };

        {
            let mut record = record.lock().await;
            if record.completed {
                return Err(GatewayError::Tracing(format!(
                    "Trace already finished: {}",
                    trace_id
                )));
            }
            record.trace.spans.push(span_id.clone());
            record.spans.insert(span_id.clone(), span.clone());
        }
        self.span_index.insert(span_id, trace_id);

        Ok(span)
    }

    /// Start a span under an existing span
    pub async fn create_child_span(
        &self,
        parent_span_id: &str,
        operation_name: &str,
        options: SpanOptions,
    ) -> GatewayResult<Span> {
        self.start_span(
            operation_name,
            SpanOptions {
                trace_id: None,
                parent_span_id: Some(parent_span_id.to_string()),
                ..options
            },
        )
        .await
    }

    /// Finish a span; a no-op for unknown or already finished spans. When
    /// this was the trace's last open span the trace completes.
    pub async fn finish_span(&self, span_id: &str, options: FinishSpanOptions) {
        let Some(record) = self.record_for_span(span_id) else {
            debug!("finish_span ignored, unknown span {}", span_id);
            return;
        };

        let completed = {
            let mut record = record.lock().await;
            if record.completed {
                return;
            }
            let Some(span) = record.spans.get_mut(span_id) else {
                return;
            };
            if span.is_finished() {
                return;
            }

            let now = current_timestamp_ms();
            span.end_time = Some(now);
            span.duration = Some(now.saturating_sub(span.start_time));
            span.status = options.status.unwrap_or(SpanStatus::Ok);
            if let Some(message) = options.error {
                span.tags.insert("error".to_string(), Value::Bool(true));
                span.tags
                    .insert("error.message".to_string(), Value::String(message));
                span.status = SpanStatus::Error;
            }
            span.tags.extend(options.tags);
            span.logs.extend(options.logs);

            if record.all_finished() {
                Some(record.complete(now))
            } else {
                None
            }
        };

        if let Some(data) = completed {
            self.on_trace_completed(data).await;
        }
    }

    /// Force a trace to complete, closing any spans still open
    pub async fn finish_trace(&self, trace_id: &str) -> bool {
        self.force_finish(trace_id, "force_finished").await
    }

    pub async fn sweep_stale_traces(&self) -> usize {
        self.sweep_stale_traces_at(Instant::now()).await
    }

    /// Force-finish live traces opened at least `max_trace_age` before `now`.
    /// Their open spans are tagged `stale`.
    pub async fn sweep_stale_traces_at(&self, now: Instant) -> usize {
        let records: Vec<(String, Arc<Mutex<TraceRecord>>)> = self
            .traces
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut swept = 0;
        for (trace_id, record) in records {
            let opened = record.lock().await.opened;
            if now.saturating_duration_since(opened) < self.config.max_trace_age {
                continue;
            }
            if self.force_finish(&trace_id, "stale").await {
                swept += 1;
            }
        }

        if swept > 0 {
            warn!("Swept {} stale traces", swept);
        }
        swept
    }

    async fn force_finish(&self, trace_id: &str, tag: &str) -> bool {
        let Some(record) = self.record(trace_id) else {
            return false;
        };

        let data = {
            let mut record = record.lock().await;
            if record.completed {
                return false;
            }

            let now = current_timestamp_ms();
            for span in record.spans.values_mut().filter(|s| !s.is_finished()) {
                span.end_time = Some(now);
                span.duration = Some(now.saturating_sub(span.start_time));
                span.status = SpanStatus::Ok;
                span.tags.insert(tag.to_string(), Value::Bool(true));
            }
            record.complete(now)
        };

        self.on_trace_completed(data).await;
        true
    }

    pub async fn set_span_tag(&self, span_id: &str, key: &str, value: Value) -> bool {
        self.with_span(span_id, |span| {
            span.tags.insert(key.to_string(), value);
        })
        .await
    }

    pub async fn log_span(&self, span_id: &str, log: SpanLog) -> bool {
        self.with_span(span_id, |span| span.logs.push(log)).await
    }

    pub async fn get_span(&self, span_id: &str) -> Option<Span> {
        let record = self.record_for_span(span_id)?;
        let record = record.lock().await;
        record.spans.get(span_id).cloned()
    }

    pub async fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        let record = self.record(trace_id)?;
        let trace = record.lock().await.trace.clone();
        Some(trace)
    }

    /// Timeline, service map and critical path of a live trace
    pub async fn get_trace_details(&self, trace_id: &str) -> Option<TraceDetails> {
        let record = self.record(trace_id)?;
        let record = record.lock().await;
        Some(TraceDetails::new(record.trace.clone(), record.ordered_spans()))
    }

    /// Search live traces
    pub async fn search_traces(&self, query: &TraceQuery) -> Vec<Trace> {
        let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let records: Vec<Arc<Mutex<TraceRecord>>> =
            self.traces.iter().map(|r| r.value().clone()).collect();

        let mut results = Vec::new();
        for record in records {
            let record = record.lock().await;
            if query.matches(&record.trace) {
                results.push(record.trace.clone());
            }
        }

        results.sort_by_key(|t| t.start_time);
        results.truncate(limit);
        results
    }

    pub async fn get_tracing_stats(&self) -> TracingStats {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);
        let total_duration = self.counters.total_duration.load(Ordering::Relaxed);

        TracingStats {
            active_traces: self.traces.len(),
            completed_traces: completed,
            exported_traces: self.counters.exported.load(Ordering::Relaxed),
            dropped_traces: self.counters.dropped.load(Ordering::Relaxed),
            error_traces: errors,
            export_failures: self.counters.export_failures.load(Ordering::Relaxed),
            pending_exports: self.pending.lock().await.len(),
            total_spans: self.span_index.len(),
            average_trace_duration: if completed > 0 {
                total_duration as f64 / completed as f64
            } else {
                0.0
            },
            error_rate: if completed > 0 {
                errors as f64 / completed as f64
            } else {
                0.0
            },
            sampling_rate: self.config.sampling_rate,
        }
    }

    /// Spawn the export worker
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }

        *worker = Some(tokio::spawn(run_export_worker(
            Arc::downgrade(self),
            self.shutdown.clone(),
            self.export_ready.clone(),
            self.config.export_interval,
        )));
        info!(
            "Trace export worker started (batch {}, interval {:?})",
            self.config.batch_size, self.config.export_interval
        );
    }

    /// Export everything that is pending
    pub async fn flush(&self) -> usize {
        let mut exported = 0;
        loop {
            let batch = self.take_batch(self.config.batch_size).await;
            if batch.is_empty() {
                return exported;
            }
            exported += batch.len();
            self.export_batch(batch).await;
        }
    }

    /// Stop the worker after a final flush
    pub async fn close(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            self.shutdown.notify_one();
            if let Err(e) = worker.await {
                warn!("Trace export worker ended abnormally: {}", e);
            }
        }

        let flushed = self.flush().await;
        info!("Tracer closed ({} traces flushed)", flushed);
    }

    /// Periodic work: drop stale traces, export a full batch
    async fn on_tick(&self) {
        self.sweep_stale_traces().await;
        if self.pending.lock().await.len() >= self.config.batch_size {
            let batch = self.take_batch(self.config.batch_size).await;
            self.export_batch(batch).await;
        }
    }

    async fn on_trace_completed(&self, data: TraceData) {
        let trace_id = data.trace.trace_id.clone();

        self.traces.remove(&trace_id);
        for span_id in &data.trace.spans {
            self.span_index.remove(span_id);
        }

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_duration
            .fetch_add(data.trace.duration.unwrap_or(0), Ordering::Relaxed);
        if data.trace.status == SpanStatus::Error {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }

        if !self.sampled() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Trace {} dropped by sampling", trace_id);
            return;
        }

        {
            let mut pending = self.pending.lock().await;
            if pending.len() >= self.config.max_pending_traces {
                pending.pop_front();
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Export queue full, dropping oldest trace");
            }
            pending.push_back(data);
        }
        self.export_ready.notify_one();
    }

    fn sampled(&self) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            return true;
        }
        rand::thread_rng().gen::<f64>() < rate
    }

    async fn take_batch(&self, size: usize) -> Vec<TraceData> {
        let mut pending = self.pending.lock().await;
        let take = size.min(pending.len());
        pending.drain(..take).collect()
    }

    async fn export_batch(&self, batch: Vec<TraceData>) {
        if batch.is_empty() {
            return;
        }

        let _guard = self.export_lock.lock().await;
        let exporters = self.exporters.read().await.clone();

        for data in &batch {
            // exporters run side by side; one failing never blocks the others
            let results = join_all(exporters.iter().map(|exporter| exporter.export(data))).await;
            for (exporter, result) in exporters.iter().zip(results) {
                if let Err(e) = result {
                    self.counters.export_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Trace exporter {} failed for {}: {}",
                        exporter.name(),
                        data.trace.trace_id,
                        e
                    );
                }
            }
            self.counters.exported.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn root_span(&self, trace: &Trace) -> GatewayResult<Span> {
        let root_id = trace
            .root_span_id()
            .ok_or_else(|| GatewayError::Tracing("Trace has no root span".to_string()))?;
        self.get_span(root_id)
            .await
            .ok_or_else(|| GatewayError::Tracing(format!("Root span not found: {}", root_id)))
    }

    async fn with_span(&self, span_id: &str, update: impl FnOnce(&mut Span)) -> bool {
        let Some(record) = self.record_for_span(span_id) else {
            return false;
        };
        let mut record = record.lock().await;
        match record.spans.get_mut(span_id) {
            Some(span) => {
                update(span);
                true
            }
            None => false,
        }
    }

    fn record(&self, trace_id: &str) -> Option<Arc<Mutex<TraceRecord>>> {
        self.traces.get(trace_id).map(|r| r.value().clone())
    }

    fn record_for_span(&self, span_id: &str) -> Option<Arc<Mutex<TraceRecord>>> {
        let trace_id = self.span_index.get(span_id).map(|t| t.value().clone())?;
        self.record(&trace_id)
    }
}

/// The worker holds the tracer weakly; it stops on shutdown or once the
/// tracer is dropped.
async fn run_export_worker(
    tracer: Weak<DistributedTracer>,
    shutdown: Arc<Notify>,
    export_ready: Arc<Notify>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = export_ready.notified() => {
                let Some(live) = tracer.upgrade() else {
                    break;
                };
                live.flush().await;
            }
            _ = ticker.tick() => {
                let Some(live) = tracer.upgrade() else {
                    break;
                };
                live.on_tick().await;
            }
        }
    }

    debug!("Trace export worker stopped");
}
