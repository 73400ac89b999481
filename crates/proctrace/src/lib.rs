//! Process Telemetry Trace Pipeline
//!
//! Accepts newline-delimited JSON process/session telemetry over TCP, turns
//! every record into an OpenTelemetry span and exports batches of spans to an
//! OTLP/HTTP collector behind retry and circuit breaking. Every batch the
//! collector accepts is followed by a session to trace correlation write to a
//! time-series store.
//!
//! # Rust 2024 Edition Features
//!
//! Exporters and sinks use native async traits (no `#[async_trait]` macro),
//! with boxed object-safe companions for dynamic dispatch.

pub mod acceptor;
pub mod batch_exporter;
pub mod batch_processor;
pub mod config;
pub mod correlation;
pub mod exporter;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod otlp;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod resilient_exporter;
pub mod shutdown;
pub mod span;
pub mod span_builder;
pub mod worker;

// Re-export main types
pub use acceptor::{AcceptorConfig, AcceptorError, ConnectionAcceptor, LineFramer};
pub use batch_exporter::{BatchExporter, BatchExporterConfig};
pub use batch_processor::{BatchConfig, BatchProcessor};
pub use config::{Config, ConfigError};
pub use correlation::{
    CorrelationPoint, CorrelationSink, CorrelationSinkBoxed, InfluxConfig, InfluxLineSink,
    SinkError,
};
pub use exporter::{ExportError, OtlpHttpExporter, SpanExporter, SpanExporterBoxed};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineContext, PipelineError};
pub use queue::{BoundedQueue, QueueClosed};
pub use record::{EventType, RecordError, TelemetryRecord};
pub use resilient_exporter::{
    CircuitBreakerConfig, CircuitBreakerExporter, CircuitState, ResilientExporter,
    ResilientExporterBuilder, RetryConfig, RetryingExporter, TimedExporter,
};
pub use shutdown::ShutdownSignal;
pub use span::{AttributeValue, Span, SpanBatch};
pub use span_builder::{build_span, derive_trace_id};
pub use worker::{RawLine, RecordWorker, spawn_workers};
