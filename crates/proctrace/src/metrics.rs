//! Pipeline metrics.
//!
//! A cloneable handle over an owned Prometheus [`Registry`]. Every component
//! receives a clone through the pipeline context; nothing is registered
//! globally, so tests can build as many independent pipelines as they like.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Bucket bounds for `batch_latency_seconds`. A send can include several
/// attempts of up to the request timeout plus backoff sleeps.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Prometheus-backed metrics shared across the pipeline.
#[derive(Clone)]
pub struct PipelineMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    records_received: IntCounter,
    records_parsed: IntCounter,
    batches_sent: IntCounter,
    export_failures: IntCounter,
    span_queue_size: IntGauge,
    batch_latency: Histogram,
    ingest_queue_size: IntGauge,
    active_connections: IntGauge,
    correlation_points_written: IntCounter,
    correlation_write_failures: IntCounter,
    circuit_breaker_open: IntGauge,
}

/// Point-in-time copy of the pipeline counters and gauges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub records_received: u64,
    pub records_parsed: u64,
    pub batches_sent: u64,
    pub export_failures: u64,
    pub span_queue_size: i64,
    pub ingest_queue_size: i64,
    pub active_connections: i64,
    pub batch_latency_count: u64,
    pub correlation_points_written: u64,
    pub correlation_write_failures: u64,
    pub circuit_breaker_open: i64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl PipelineMetrics {
    /// Construct a new registry with every pipeline collector registered.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be created or registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let records_received = counter(
            &registry,
            "records_received_total",
            "Raw lines taken off the ingest queue",
        )?;
        let records_parsed = counter(
            &registry,
            "records_parsed_total",
            "Records decoded and turned into spans",
        )?;
        let batches_sent = counter(
            &registry,
            "batches_sent_total",
            "Span batches accepted by the OTLP collector",
        )?;
        let export_failures = counter(
            &registry,
            "export_failures_total",
            "Span batches dropped after retries were exhausted or the circuit was open",
        )?;
        let span_queue_size = gauge(&registry, "span_queue_size", "Spans waiting to be batched")?;
        let batch_latency = Histogram::with_opts(
            HistogramOpts::new(
                "batch_latency_seconds",
                "Time spent sending one batch, retries included",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(batch_latency.clone()))?;
        let ingest_queue_size = gauge(
            &registry,
            "ingest_queue_size",
            "Raw lines waiting for a worker",
        )?;
        let active_connections = gauge(
            &registry,
            "active_connections",
            "Open ingest connections",
        )?;
        let correlation_points_written = counter(
            &registry,
            "correlation_points_written_total",
            "Session to trace correlation points written to the time-series sink",
        )?;
        let correlation_write_failures = counter(
            &registry,
            "correlation_write_failures_total",
            "Failed correlation sink writes",
        )?;
        let circuit_breaker_open = gauge(
            &registry,
            "circuit_breaker_open",
            "1 while the export circuit breaker is open or half-open",
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                records_received,
                records_parsed,
                batches_sent,
                export_failures,
                span_queue_size,
                batch_latency,
                ingest_queue_size,
                active_connections,
                correlation_points_written,
                correlation_write_failures,
                circuit_breaker_open,
            }),
        })
    }

    pub fn inc_records_received(&self) {
        self.inner.records_received.inc();
    }

    pub fn inc_records_parsed(&self) {
        self.inner.records_parsed.inc();
    }

    pub fn inc_batches_sent(&self) {
        self.inner.batches_sent.inc();
    }

    pub fn inc_export_failures(&self) {
        self.inner.export_failures.inc();
    }

    pub fn set_span_queue_size(&self, depth: usize) {
        self.inner.span_queue_size.set(gauge_value(depth));
    }

    pub fn set_ingest_queue_size(&self, depth: usize) {
        self.inner.ingest_queue_size.set(gauge_value(depth));
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.inc();
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.dec();
    }

    pub fn add_correlation_points_written(&self, count: usize) {
        self.inner
            .correlation_points_written
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }

    pub fn inc_correlation_write_failures(&self) {
        self.inner.correlation_write_failures.inc();
    }

    /// Histogram the export stack observes send latency into.
    pub fn batch_latency(&self) -> Histogram {
        self.inner.batch_latency.clone()
    }

    /// Gauge the circuit breaker publishes its state through.
    pub fn circuit_breaker_open(&self) -> IntGauge {
        self.inner.circuit_breaker_open.clone()
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or produces invalid UTF-8.
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Take a point-in-time snapshot of all counters and gauges.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_received: self.inner.records_received.get(),
            records_parsed: self.inner.records_parsed.get(),
            batches_sent: self.inner.batches_sent.get(),
            export_failures: self.inner.export_failures.get(),
            span_queue_size: self.inner.span_queue_size.get(),
            ingest_queue_size: self.inner.ingest_queue_size.get(),
            active_connections: self.inner.active_connections.get(),
            batch_latency_count: self.inner.batch_latency.get_sample_count(),
            correlation_points_written: self.inner.correlation_points_written.get(),
            correlation_write_failures: self.inner.correlation_write_failures.get(),
            circuit_breaker_open: self.inner.circuit_breaker_open.get(),
        }
    }
}

fn gauge_value(depth: usize) -> i64 {
    i64::try_from(depth).unwrap_or(i64::MAX)
}
