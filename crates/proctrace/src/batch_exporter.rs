//! Batch Exporter - the single consumer of the span queue.
//!
//! Each cycle either collects a batch and sends it, or finds the queue idle
//! for a whole poll interval and does nothing:
//!
//! ```text
//! collecting ──► sending ──► success ──► correlation write ──┐
//!     ▲                  └─► failed (counted, batch dropped) ─┤
//!     └───────────────────────────────────────────────────────┘
//! ```
//!
//! Sends run inline, so at most one batch is in flight and the span queue
//! fills up (pushing back on the workers) while the collector is slow.

use crate::batch_processor::{BatchConfig, BatchProcessor};
use crate::correlation::{CorrelationSinkBoxed, correlation_points, now_nanos};
use crate::exporter::SpanExporterBoxed;
use crate::metrics::PipelineMetrics;
use crate::queue::BoundedQueue;
use crate::shutdown::ShutdownSignal;
use crate::span::{Span, SpanBatch};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the exporter loop
#[derive(Debug, Clone)]
pub struct BatchExporterConfig {
    /// Size and time bounds of one batch
    pub batch: BatchConfig,
    /// How long an idle pull waits before the loop checks for shutdown
    pub poll_interval: Duration,
}

impl Default for BatchExporterConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Pulls spans, batches them and sends each batch through the export stack.
pub struct BatchExporter {
    queue: BoundedQueue<Span>,
    exporter: Arc<dyn SpanExporterBoxed>,
    sink: Option<Arc<dyn CorrelationSinkBoxed>>,
    metrics: PipelineMetrics,
    processor: BatchProcessor,
    poll_interval: Duration,
}

impl BatchExporter {
    pub fn new(
        config: BatchExporterConfig,
        queue: BoundedQueue<Span>,
        exporter: Arc<dyn SpanExporterBoxed>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            queue,
            exporter,
            sink: None,
            metrics,
            processor: BatchProcessor::new(config.batch),
            poll_interval: config.poll_interval,
        }
    }

    /// Writes correlation points to `sink` after every successful batch.
    pub fn with_correlation_sink(mut self, sink: Arc<dyn CorrelationSinkBoxed>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Runs until `stop` is triggered and the span queue is empty.
    ///
    /// A batch that is still open when `stop` fires is completed and sent
    /// before the loop exits.
    pub async fn run(mut self, stop: ShutdownSignal) {
        tracing::info!(
            exporter = self.exporter.name(),
            batch_size = self.processor.config().batch_size_limit,
            batch_timeout = ?self.processor.config().batch_timeout,
            "batch exporter started"
        );

        loop {
            if let Some(batch) = self.collect().await {
                self.dispatch(batch).await;
            }
            self.metrics.set_span_queue_size(self.queue.len());

            if stop.is_shutdown() && self.queue.is_empty() {
                break;
            }
        }

        tracing::info!("batch exporter stopped");
    }

    /// Collects one batch.
    ///
    /// Waits up to the poll interval for a first span; returns `None` if none
    /// came. Otherwise keeps pulling until the batch is full or its window has
    /// expired.
    async fn collect(&mut self) -> Option<SpanBatch> {
        let first = self.queue.pop_timeout(self.poll_interval).await?;
        self.processor.add(first);

        while !self.processor.should_flush() {
            let Some(remaining) = self.processor.remaining_window() else {
                break;
            };
            match self.queue.pop_timeout(remaining).await {
                Some(span) => self.processor.add(span),
                None => break,
            }
        }

        self.processor.take_batch()
    }

    async fn dispatch(&self, batch: SpanBatch) {
        tracing::debug!(spans = batch.len(), "sending batch");

        match self.exporter.export_boxed(&batch).await {
            Ok(()) => {
                self.metrics.inc_batches_sent();
                tracing::debug!(spans = batch.len(), "batch exported");
                self.write_correlation(&batch).await;
            }
            Err(e) => {
                self.metrics.inc_export_failures();
                tracing::error!(spans = batch.len(), error = %e, "batch export failed, dropping batch");
            }
        }
    }

    async fn write_correlation(&self, batch: &SpanBatch) {
        let Some(sink) = &self.sink else {
            return;
        };
        let points = correlation_points(batch, now_nanos());
        if points.is_empty() {
            return;
        }

        match sink.write_boxed(&points).await {
            Ok(()) => {
                self.metrics.add_correlation_points_written(points.len());
                tracing::debug!(points = points.len(), sink = sink.name(), "correlation points written");
            }
            Err(e) => {
                self.metrics.inc_correlation_write_failures();
                tracing::warn!(points = points.len(), error = %e, "correlation write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{CorrelationPoint, CorrelationSink, SinkError};
    use crate::exporter::{ExportError, RecordingExporter, SpanExporter};
    use crate::record::TelemetryRecord;
    use crate::span_builder::build_span;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tokio::task::JoinHandle;

    struct AlwaysFailing {
        calls: AtomicUsize,
    }

    impl SpanExporter for AlwaysFailing {
        async fn export(&self, _batch: &SpanBatch) -> Result<(), ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExportError::Status(500))
        }

        fn name(&self) -> &str {
            "always_failing"
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<Vec<CorrelationPoint>>>,
        fail: bool,
    }

    impl CorrelationSink for RecordingSink {
        async fn write(&self, points: &[CorrelationPoint]) -> Result<(), SinkError> {
            self.writes.lock().unwrap().push(points.to_vec());
            if self.fail {
                Err(SinkError::Status(500))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn make_span(proc_id: u64, guid: &str) -> Span {
        let record = TelemetryRecord {
            proc_id,
            session_guid: Some(guid.to_string()),
            ..Default::default()
        };
        build_span(&record, SystemTime::now())
    }

    fn config(size: usize, timeout_ms: u64) -> BatchExporterConfig {
        BatchExporterConfig {
            batch: BatchConfig {
                batch_size_limit: size,
                batch_timeout: Duration::from_millis(timeout_ms),
            },
            poll_interval: Duration::from_secs(1),
        }
    }

    fn spawn(exporter: BatchExporter) -> (ShutdownSignal, JoinHandle<()>) {
        let stop = ShutdownSignal::new();
        let handle = tokio::spawn(exporter.run(stop.clone()));
        (stop, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_splits_at_batch_size() {
        let queue = BoundedQueue::new(1000);
        let recorder = Arc::new(RecordingExporter::new());
        let metrics = PipelineMetrics::new().unwrap();
        for i in 0..250 {
            queue.push(make_span(i, "g")).await.unwrap();
        }

        let exporter = BatchExporter::new(config(200, 200), queue, recorder.clone(), metrics.clone());
        let (stop, handle) = spawn(exporter);
        stop.shutdown();
        handle.await.unwrap();

        assert_eq!(recorder.batch_sizes(), vec![200, 50]);
        assert_eq!(metrics.snapshot().batches_sent, 2);
        assert_eq!(metrics.snapshot().span_queue_size, 0);

        let ids: Vec<u64> = recorder.spans().iter().map(|s| s.span_id).collect();
        assert_eq!(ids, (0..250).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_over_batch_size_yields_full_first_batch() {
        let queue = BoundedQueue::new(1000);
        let recorder = Arc::new(RecordingExporter::new());
        for i in 0..201 {
            queue.push(make_span(i, "g")).await.unwrap();
        }

        let exporter = BatchExporter::new(
            config(200, 200),
            queue,
            recorder.clone(),
            PipelineMetrics::new().unwrap(),
        );
        let (stop, handle) = spawn(exporter);
        stop.shutdown();
        handle.await.unwrap();

        let sizes = recorder.batch_sizes();
        assert!(sizes.len() >= 2);
        assert_eq!(sizes[0], 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_spans_each_get_their_own_batch() {
        let queue = BoundedQueue::new(100);
        let recorder = Arc::new(RecordingExporter::new());
        let exporter = BatchExporter::new(
            config(200, 200),
            queue.clone(),
            recorder.clone(),
            PipelineMetrics::new().unwrap(),
        );
        let (stop, handle) = spawn(exporter);

        for i in 0..3 {
            queue.push(make_span(i, "g")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        stop.shutdown();
        handle.await.unwrap();

        assert_eq!(recorder.batch_sizes(), vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_flushed_at_window_end() {
        let queue = BoundedQueue::new(100);
        let recorder = Arc::new(RecordingExporter::new());
        let exporter = BatchExporter::new(
            config(200, 200),
            queue.clone(),
            recorder.clone(),
            PipelineMetrics::new().unwrap(),
        );
        let (stop, handle) = spawn(exporter);

        queue.push(make_span(1, "g")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.push(make_span(2, "g")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.batch_sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.batch_sizes(), vec![2]);

        stop.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batches_are_counted_and_dropped() {
        let queue = BoundedQueue::new(100);
        let failing = Arc::new(AlwaysFailing {
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let metrics = PipelineMetrics::new().unwrap();
        for i in 0..5 {
            queue.push(make_span(i, "g")).await.unwrap();
        }

        let exporter = BatchExporter::new(config(2, 200), queue, failing.clone(), metrics.clone())
            .with_correlation_sink(sink.clone());
        let (stop, handle) = spawn(exporter);
        stop.shutdown();
        handle.await.unwrap();

        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.export_failures, 3);
        assert_eq!(snapshot.batches_sent, 0);
        assert!(sink.writes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_correlation_points_per_unique_guid() {
        let queue = BoundedQueue::new(100);
        let sink = Arc::new(RecordingSink::default());
        let metrics = PipelineMetrics::new().unwrap();
        for (i, guid) in ["a", "b", "a", ""].iter().enumerate() {
            queue.push(make_span(i as u64, guid)).await.unwrap();
        }

        let exporter = BatchExporter::new(
            config(200, 200),
            queue,
            Arc::new(RecordingExporter::new()),
            metrics.clone(),
        )
        .with_correlation_sink(sink.clone());
        let (stop, handle) = spawn(exporter);
        stop.shutdown();
        handle.await.unwrap();

        let writes = sink.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let guids: Vec<&str> = writes[0].iter().map(|p| p.guid.as_str()).collect();
        assert_eq!(guids, ["a", "b"]);
        assert_eq!(metrics.snapshot().correlation_points_written, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_does_not_fail_batch() {
        let queue = BoundedQueue::new(100);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let metrics = PipelineMetrics::new().unwrap();
        queue.push(make_span(1, "a")).await.unwrap();

        let exporter = BatchExporter::new(
            config(200, 200),
            queue,
            Arc::new(RecordingExporter::new()),
            metrics.clone(),
        )
        .with_correlation_sink(sink.clone());
        let (stop, handle) = spawn(exporter);
        stop.shutdown();
        handle.await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_sent, 1);
        assert_eq!(snapshot.export_failures, 0);
        assert_eq!(snapshot.correlation_write_failures, 1);
        assert_eq!(snapshot.correlation_points_written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_exporter_stops_within_poll_interval() {
        let recorder = Arc::new(RecordingExporter::new());
        let exporter = BatchExporter::new(
            config(200, 200),
            BoundedQueue::new(10),
            recorder.clone(),
            PipelineMetrics::new().unwrap(),
        );
        let (stop, handle) = spawn(exporter);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let start = tokio::time::Instant::now();
        stop.shutdown();
        handle.await.unwrap();

        assert!(start.elapsed() <= Duration::from_secs(1));
        assert!(recorder.batch_sizes().is_empty());
    }
}
