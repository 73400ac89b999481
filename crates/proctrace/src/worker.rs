//! Record Processor - the worker pool between the two queues.
//!
//! Every worker runs the same loop: take one raw line, decode it, build a span
//! and hand it to the span queue. A line that does not decode is logged and
//! dropped; nothing a single line contains can stop a worker.

use crate::metrics::PipelineMetrics;
use crate::queue::BoundedQueue;
use crate::record::TelemetryRecord;
use crate::shutdown::ShutdownSignal;
use crate::span::Span;
use crate::span_builder::build_span;
use std::time::{Duration, SystemTime};
use tokio::task::JoinSet;

/// One line as read off an ingest connection, without its terminator.
pub type RawLine = Vec<u8>;

/// How long an idle worker waits for a line before checking for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A single worker. Workers hold no state between lines.
#[derive(Clone)]
pub struct RecordWorker {
    id: usize,
    lines: BoundedQueue<RawLine>,
    spans: BoundedQueue<Span>,
    metrics: PipelineMetrics,
    poll_interval: Duration,
}

impl RecordWorker {
    pub fn new(
        id: usize,
        lines: BoundedQueue<RawLine>,
        spans: BoundedQueue<Span>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            id,
            lines,
            spans,
            metrics,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Processes one line. Returns the span it produced, if any.
    pub fn process(&self, line: &[u8]) -> Option<Span> {
        self.metrics.inc_records_received();
        match TelemetryRecord::from_slice(line) {
            Ok(record) => {
                self.metrics.inc_records_parsed();
                Some(build_span(&record, SystemTime::now()))
            }
            Err(e) => {
                tracing::warn!(
                    worker = self.id,
                    error = %e,
                    line = %preview(line),
                    "dropping undecodable record"
                );
                None
            }
        }
    }

    /// Runs until `stop` is triggered and the line queue is empty.
    pub async fn run(self, stop: ShutdownSignal) {
        tracing::debug!(worker = self.id, "worker started");
        loop {
            match self.lines.pop_timeout(self.poll_interval).await {
                Some(line) => {
                    if let Some(span) = self.process(&line)
                        && self.spans.push(span).await.is_err()
                    {
                        tracing::error!(worker = self.id, "span queue closed, worker exiting");
                        break;
                    }
                    self.metrics.set_ingest_queue_size(self.lines.len());
                }
                None if stop.is_shutdown() => break,
                None => {}
            }
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }
}

/// Spawns `count` workers sharing both queues.
pub fn spawn_workers(
    count: usize,
    lines: &BoundedQueue<RawLine>,
    spans: &BoundedQueue<Span>,
    metrics: &PipelineMetrics,
    stop: &ShutdownSignal,
    poll_interval: Duration,
) -> JoinSet<()> {
    let mut workers = JoinSet::new();
    for id in 0..count {
        let worker = RecordWorker::new(id, lines.clone(), spans.clone(), metrics.clone())
            .with_poll_interval(poll_interval);
        workers.spawn(worker.run(stop.clone()));
    }
    tracing::info!(workers = count, "worker pool started");
    workers
}

const PREVIEW_LEN: usize = 120;

/// Short printable excerpt of a raw line for log output.
fn preview(line: &[u8]) -> String {
    let shown = &line[..line.len().min(PREVIEW_LEN)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if line.len() > PREVIEW_LEN {
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPLORER: &[u8] = br#"{"SessionGUID":"abcd1234-0000-0000-0000-000000000000","ProcID":100,"ProcParentID":0,"ProcName":"explorer.exe","ProcLifetimeMs":5000,"LogonProcType":"Interactive"}"#;

    fn worker(metrics: &PipelineMetrics) -> (RecordWorker, BoundedQueue<RawLine>, BoundedQueue<Span>) {
        let lines = BoundedQueue::new(16);
        let spans = BoundedQueue::new(16);
        let worker = RecordWorker::new(0, lines.clone(), spans.clone(), metrics.clone());
        (worker, lines, spans)
    }

    #[test]
    fn test_valid_line_counts_both() {
        let metrics = PipelineMetrics::new().unwrap();
        let (worker, _, _) = worker(&metrics);

        let span = worker.process(EXPLORER).unwrap();
        assert_eq!(span.span_id_hex(), "0000000000000064");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_received, 1);
        assert_eq!(snapshot.records_parsed, 1);
    }

    #[test]
    fn test_invalid_lines_are_received_but_not_parsed() {
        let metrics = PipelineMetrics::new().unwrap();
        let (worker, _, _) = worker(&metrics);

        for line in [&b"not json"[..], b"[1,2,3]", b"{\"ProcID\":", b"42"] {
            assert!(worker.process(line).is_none());
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_received, 4);
        assert_eq!(snapshot.records_parsed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_moves_lines_to_span_queue() {
        let metrics = PipelineMetrics::new().unwrap();
        let (worker, lines, spans) = worker(&metrics);
        let stop = ShutdownSignal::new();

        lines.push(EXPLORER.to_vec()).await.unwrap();
        lines.push(b"garbage".to_vec()).await.unwrap();
        lines.push(EXPLORER.to_vec()).await.unwrap();

        let handle = tokio::spawn(worker.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.shutdown();
        handle.await.unwrap();

        assert_eq!(spans.len(), 2);
        assert!(lines.is_empty());
        assert_eq!(metrics.snapshot().records_received, 3);
        assert_eq!(metrics.snapshot().ingest_queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_drains_before_exit() {
        let metrics = PipelineMetrics::new().unwrap();
        let lines = BoundedQueue::new(256);
        let spans = BoundedQueue::new(256);
        let stop = ShutdownSignal::new();

        for _ in 0..100 {
            lines.push(EXPLORER.to_vec()).await.unwrap();
        }
        // Signalled before the workers even start; they still drain the queue
        stop.shutdown();
        let mut workers = spawn_workers(4, &lines, &spans, &metrics, &stop, DEFAULT_POLL_INTERVAL);
        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }

        assert_eq!(spans.len(), 100);
        assert_eq!(metrics.snapshot().records_parsed, 100);
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(b"short"), "short");
        let long = vec![b'x'; 500];
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.len(), 123);
    }
}
