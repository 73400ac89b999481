//! Size/time bounded span batching.
//!
//! Accumulates spans in arrival order and decides when the pending batch must
//! be dispatched. It owns no exporter, no queue and no clock of its own beyond
//! `tokio::time::Instant`, so it is testable without any concurrency
//! machinery; the exporter actor in `batch_exporter` drives it.
//!
//! # Flush rule
//!
//! A batch is due when it holds `batch_size_limit` spans, or when
//! `batch_timeout` has elapsed since its *first* span was added, whichever
//! comes first. An empty processor is never due, so an idle window produces no
//! batch at all.

use crate::span::{Span, SpanBatch};
use std::time::Duration;
use tokio::time::Instant;

/// Batch bounds
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Spans per batch, at most
    pub batch_size_limit: usize,
    /// Maximum time a batch stays open after its first span
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: 200,
            batch_timeout: Duration::from_millis(200),
        }
    }
}

/// Holds the open batch and decides when it is due.
#[derive(Debug)]
pub struct BatchProcessor {
    /// Arrival order
    pending: Vec<Span>,
    config: BatchConfig,
    /// When the first span of the pending batch arrived
    first_span_at: Option<Instant>,
}

/// Upper bound on the pending buffer reserved up front.
const PREALLOCATED_SPANS: usize = 1024;

fn pending_buffer(config: &BatchConfig) -> Vec<Span> {
    Vec::with_capacity(config.batch_size_limit.min(PREALLOCATED_SPANS))
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: pending_buffer(&config),
            config,
            first_span_at: None,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Adds a span to the pending batch, opening the window if it was empty.
    pub fn add(&mut self, span: Span) {
        if self.first_span_at.is_none() {
            self.first_span_at = Some(Instant::now());
        }
        self.pending.push(span);
    }

    /// Spans in the open batch.
    pub fn total_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True once the size cap is reached.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.config.batch_size_limit
    }

    /// Time left before the open window expires.
    ///
    /// `None` when nothing is pending; `Some(Duration::ZERO)` once expired.
    pub fn remaining_window(&self) -> Option<Duration> {
        self.first_span_at.map(|first| {
            self.config
                .batch_timeout
                .saturating_sub(first.elapsed())
        })
    }

    /// Due by size or by window
    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.is_full() || self.remaining_window() == Some(Duration::ZERO))
    }

    /// Takes the pending spans as a batch and resets the window.
    ///
    /// Returns `None` if nothing is pending.
    pub fn take_batch(&mut self) -> Option<SpanBatch> {
        if self.pending.is_empty() {
            return None;
        }
        self.first_span_at = None;
        let spans = std::mem::replace(&mut self.pending, pending_buffer(&self.config));
        debug_assert!(spans.len() <= self.config.batch_size_limit);
        Some(SpanBatch::with_spans(spans))
    }
}
