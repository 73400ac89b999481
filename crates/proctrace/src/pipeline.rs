//! Pipeline assembly and lifecycle.
//!
//! ```text
//!  TCP clients ──► acceptor ──► [ingest queue] ──► workers ──► [span queue]
//!                                                                    │
//!            time-series sink ◄── correlation ◄── batch exporter ◄───┘
//!                                                        │
//!                                                        └──► OTLP collector
//! ```
//!
//! # Shutdown order
//!
//! 1. the acceptor stops accepting, open connections stop being read and
//!    their readers push what they already framed
//! 2. workers drain the ingest queue and exit
//! 3. the exporter drains the span queue, sends the last partial batch and
//!    exits
//! 4. the metrics server stops
//!
//! Workers and the exporter each get their own stop signal. Workers are
//! stopped once every reader has exited, the exporter once every worker has,
//! so nothing pushed during the drain is left in a queue.

use crate::acceptor::{AcceptorError, ConnectionAcceptor};
use crate::batch_exporter::BatchExporter;
use crate::config::{Config, ConfigError};
use crate::correlation::{CorrelationSinkBoxed, InfluxLineSink, SinkError};
use crate::exporter::{ExportError, OtlpHttpExporter, SpanExporterBoxed};
use crate::metrics::PipelineMetrics;
use crate::metrics_server::serve_metrics;
use crate::queue::BoundedQueue;
use crate::resilient_exporter::ResilientExporterBuilder;
use crate::shutdown::ShutdownSignal;
use crate::span::Span;
use crate::worker::{RawLine, spawn_workers};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Startup errors. Anything past startup is logged and counted instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Acceptor(#[from] AcceptorError),
    #[error("failed to bind metrics endpoint {address}: {source}")]
    MetricsBind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("failed to set up exporter: {0}")]
    Exporter(#[from] ExportError),
    #[error("failed to set up correlation sink: {0}")]
    Sink(#[from] SinkError),
}

/// State shared by every pipeline component.
#[derive(Clone)]
pub struct PipelineContext {
    pub lines: BoundedQueue<RawLine>,
    pub spans: BoundedQueue<Span>,
    pub metrics: PipelineMetrics,
}

impl PipelineContext {
    pub fn new(queue_capacity: usize) -> Result<Self, PipelineError> {
        Ok(Self {
            lines: BoundedQueue::new(queue_capacity),
            spans: BoundedQueue::new(queue_capacity),
            metrics: PipelineMetrics::new()?,
        })
    }
}

/// A bound, ready-to-run pipeline.
pub struct Pipeline {
    config: Config,
    context: PipelineContext,
    acceptor: ConnectionAcceptor,
    metrics_listener: TcpListener,
    exporter: Arc<dyn SpanExporterBoxed>,
    sink: Option<Arc<dyn CorrelationSinkBoxed>>,
}

impl Pipeline {
    /// Validates `config`, builds the export stack and binds both sockets.
    pub async fn bind(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let context = PipelineContext::new(config.queue_maxsize)?;

        let transport = OtlpHttpExporter::new(config.otlp_endpoint.clone(), config.export_timeout)?;
        let exporter = ResilientExporterBuilder::new(transport)
            .with_retry(config.retry_config())
            .with_circuit_breaker(config.circuit_breaker_config())
            .with_state_gauge(context.metrics.circuit_breaker_open())
            .build(context.metrics.batch_latency());

        let sink: Option<Arc<dyn CorrelationSinkBoxed>> = match config.influx_config() {
            Some(influx) => Some(Arc::new(InfluxLineSink::new(influx)?)),
            None => None,
        };

        Self::bind_with(config, context, Arc::new(exporter), sink).await
    }

    /// Binds both sockets around an already built exporter and sink.
    pub async fn bind_with(
        config: Config,
        context: PipelineContext,
        exporter: Arc<dyn SpanExporterBoxed>,
        sink: Option<Arc<dyn CorrelationSinkBoxed>>,
    ) -> Result<Self, PipelineError> {
        let acceptor = ConnectionAcceptor::bind(
            &config.listen_address(),
            config.acceptor_config(),
            context.lines.clone(),
            context.metrics.clone(),
        )
        .await?;

        let metrics_address = config.metrics_address();
        let metrics_listener =
            TcpListener::bind(&metrics_address)
                .await
                .map_err(|e| PipelineError::MetricsBind {
                    address: metrics_address,
                    source: e,
                })?;

        Ok(Self {
            config,
            context,
            acceptor,
            metrics_listener,
            exporter,
            sink,
        })
    }

    pub fn ingest_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn metrics_addr(&self) -> io::Result<SocketAddr> {
        self.metrics_listener.local_addr()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.context.metrics
    }

    /// Runs until `stop` is triggered, then drains both queues.
    pub async fn run(self, stop: ShutdownSignal) {
        let Self {
            config,
            context,
            acceptor,
            metrics_listener,
            exporter,
            sink,
        } = self;

        tracing::info!(
            ingest = %config.listen_address(),
            metrics = %config.metrics_address(),
            otlp_endpoint = %config.otlp_endpoint,
            workers = config.worker_count,
            batch_size = config.batch_size,
            batch_timeout = ?config.batch_timeout,
            queue_maxsize = config.queue_maxsize,
            correlation = sink.is_some(),
            "pipeline starting"
        );

        let metrics_stop = ShutdownSignal::new();
        let metrics_server = tokio::spawn(serve_metrics(
            metrics_listener,
            context.metrics.clone(),
            metrics_stop.clone(),
        ));

        let worker_stop = ShutdownSignal::new();
        let mut workers = spawn_workers(
            config.worker_count,
            &context.lines,
            &context.spans,
            &context.metrics,
            &worker_stop,
            config.poll_interval,
        );

        let exporter_stop = ShutdownSignal::new();
        let mut batch_exporter = BatchExporter::new(
            config.batch_exporter_config(),
            context.spans.clone(),
            exporter,
            context.metrics.clone(),
        );
        if let Some(sink) = sink {
            batch_exporter = batch_exporter.with_correlation_sink(sink);
        }
        let exporter_task = tokio::spawn(batch_exporter.run(exporter_stop.clone()));

        acceptor.run(stop).await;

        tracing::info!(
            ingest_queue = context.lines.len(),
            span_queue = context.spans.len(),
            "draining queues"
        );
        worker_stop.shutdown();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker task failed");
            }
        }

        exporter_stop.shutdown();
        if let Err(e) = exporter_task.await {
            tracing::error!(error = %e, "exporter task failed");
        }

        metrics_stop.shutdown();
        match metrics_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "metrics server failed"),
            Err(e) => tracing::error!(error = %e, "metrics server task failed"),
        }

        let snapshot = context.metrics.snapshot();
        tracing::info!(
            records_received = snapshot.records_received,
            records_parsed = snapshot.records_parsed,
            batches_sent = snapshot.batches_sent,
            export_failures = snapshot.export_failures,
            "pipeline stopped"
        );
    }
}
