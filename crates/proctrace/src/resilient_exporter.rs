//! Export Stack Layers
//!
//! The collector call is wrapped in three layers, each itself a `SpanExporter`:
//!
//! - [`RetryingExporter`]: re-sends a failed batch after a capped exponential wait
//! - [`TimedExporter`]: observes how long a batch took, retries included
//! - [`CircuitBreakerExporter`]: stops calling a collector that keeps failing
//!
//! [`ResilientExporterBuilder`] stacks them in that order around a transport.

use crate::exporter::{ExportError, SpanExporter};
use crate::span::SpanBatch;
use prometheus::{Histogram, IntGauge};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};

// -----------------------------------------------------------------------------
// Retry
// -----------------------------------------------------------------------------

/// Retry schedule for one batch.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Wait before attempt `attempt`, counted from 0. The first attempt never waits.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.min(self.max_delay)
    }
}

/// Re-sends a batch until it is accepted or the attempts run out.
///
/// Any error is retried except [`ExportError::CircuitOpen`]. Once the budget is
/// spent the last error is reported inside [`ExportError::RetriesExhausted`].
pub struct RetryingExporter<E: SpanExporter> {
    inner: E,
    config: RetryConfig,
    total_retries: AtomicU64,
    recovered_exports: AtomicU64,
}

impl<E: SpanExporter> RetryingExporter<E> {
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    /// Attempts made beyond the first, over all batches.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Batches accepted on a later attempt.
    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }

    /// Returns the wrapped exporter.
    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: SpanExporter> SpanExporter for RetryingExporter<E> {
    async fn export(&self, batch: &SpanBatch) -> Result<(), ExportError> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug_assert!(
                    delay <= self.config.max_delay,
                    "delay {:?} exceeds max_delay {:?}",
                    delay,
                    self.config.max_delay
                );
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                sleep(delay).await;
            }

            match self.inner.export(batch).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(attempt = attempt + 1, "export recovered after retry");
                    }
                    return Ok(());
                }
                Err(ExportError::CircuitOpen) => return Err(ExportError::CircuitOpen),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "export attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ExportError::RetriesExhausted {
            attempts: max_attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// -----------------------------------------------------------------------------
// Timing
// -----------------------------------------------------------------------------

/// Observes the duration of every call in seconds, failed calls included.
///
/// Around a [`RetryingExporter`] one sample covers all attempts and waits of a
/// batch.
pub struct TimedExporter<E: SpanExporter> {
    inner: E,
    latency: Histogram,
}

impl<E: SpanExporter> TimedExporter<E> {
    pub fn new(inner: E, latency: Histogram) -> Self {
        Self { inner, latency }
    }
}

impl<E: SpanExporter> SpanExporter for TimedExporter<E> {
    async fn export(&self, batch: &SpanBatch) -> Result<(), ExportError> {
        let start = Instant::now();
        let result = self.inner.export(batch).await;
        self.latency.observe(start.elapsed().as_secs_f64());
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// -----------------------------------------------------------------------------
// Circuit breaker
// -----------------------------------------------------------------------------

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls reach the collector.
    Closed,
    /// Calls are rejected locally.
    Open,
    /// One trial call is in flight; everything else is rejected.
    HalfOpen,
}

/// When the breaker trips and when it tries again.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed batches that open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is admitted.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Rejects calls with [`ExportError::CircuitOpen`] while the collector is
/// considered down.
///
/// `failure_threshold` failed calls in a row open the breaker. After
/// `reset_timeout` a single trial call goes through; success closes the
/// breaker, failure opens it for another full timeout.
///
/// ```text
///  Closed ──(threshold reached)──► Open ──(reset_timeout)──► HalfOpen
///    ▲                              ▲                           │
///    │                              └──────(trial fails)────────┤
///    └───────────────────────(trial succeeds)───────────────────┘
/// ```
pub struct CircuitBreakerExporter<E: SpanExporter> {
    inner: E,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    times_opened: AtomicU32,
    /// Mirrors `state != Closed` as 0/1
    open_gauge: Option<IntGauge>,
}

impl<E: SpanExporter> CircuitBreakerExporter<E> {
    pub fn new(inner: E, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(BreakerState::new()),
            times_opened: AtomicU32::new(0),
            open_gauge: None,
        }
    }

    /// Publishes the open/closed state through `gauge`.
    pub fn with_state_gauge(mut self, gauge: IntGauge) -> Self {
        gauge.set(0);
        self.open_gauge = Some(gauge);
        self
    }

    /// Current position.
    pub fn state(&self) -> CircuitState {
        self.lock_state().state
    }

    /// Number of Closed/HalfOpen to Open transitions.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: CircuitState) {
        if let Some(gauge) = &self.open_gauge {
            gauge.set(i64::from(state != CircuitState::Closed));
        }
    }

    /// Admits or rejects a call, moving Open to HalfOpen once the timeout is up.
    fn admit(&self) -> bool {
        let mut state = self.lock_state();

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(opened_at) = state.opened_at
                    && opened_at.elapsed() >= self.config.reset_timeout
                {
                    state.state = CircuitState::HalfOpen;
                    tracing::info!("circuit breaker half-open, allowing trial export");
                    return true;
                }
                false
            }
            // The trial request is still in flight
            CircuitState::HalfOpen => false,
        }
    }

    fn on_success(&self) {
        let mut state = self.lock_state();
        if state.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        drop(state);
        self.publish(CircuitState::Closed);
    }

    fn on_failure(&self) {
        let mut state = self.lock_state();
        let before = state.state;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }

        let after = state.state;
        let failures = state.consecutive_failures;
        drop(state);

        debug_assert_ne!(after, CircuitState::HalfOpen, "a failure never leaves the breaker half-open");

        if before != CircuitState::Open && after == CircuitState::Open {
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                consecutive_failures = failures,
                reset_timeout = ?self.config.reset_timeout,
                "circuit breaker opened"
            );
        }
        self.publish(after);
    }
}

impl<E: SpanExporter> SpanExporter for CircuitBreakerExporter<E> {
    async fn export(&self, batch: &SpanBatch) -> Result<(), ExportError> {
        if !self.admit() {
            return Err(ExportError::CircuitOpen);
        }

        let result = self.inner.export(batch).await;
        match &result {
            Ok(()) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// -----------------------------------------------------------------------------
// Stack
// -----------------------------------------------------------------------------

/// Breaker around timing around retry around the transport.
pub type ResilientExporter<E> = CircuitBreakerExporter<TimedExporter<RetryingExporter<E>>>;

/// Assembles a [`ResilientExporter`].
///
/// The breaker sits outermost, so a batch counts as one breaker failure only
/// after its whole retry budget is spent. Unset configs fall back to their
/// defaults.
///
/// # Example
///
/// ```ignore
/// let exporter = ResilientExporterBuilder::new(OtlpHttpExporter::new(endpoint, timeout)?)
///     .with_retry(RetryConfig::default())
///     .with_circuit_breaker(CircuitBreakerConfig::default())
///     .build(metrics.batch_latency());
/// ```
pub struct ResilientExporterBuilder<E: SpanExporter> {
    inner: E,
    retry_config: Option<RetryConfig>,
    circuit_config: Option<CircuitBreakerConfig>,
    state_gauge: Option<IntGauge>,
}

impl<E: SpanExporter> ResilientExporterBuilder<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            retry_config: None,
            circuit_config: None,
            state_gauge: None,
        }
    }

    /// Retry schedule for the inner layer.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    /// Breaker thresholds for the outer layer.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_config = Some(config);
        self
    }

    /// Gauge set to 1 while the breaker is not closed.
    pub fn with_state_gauge(mut self, gauge: IntGauge) -> Self {
        self.state_gauge = Some(gauge);
        self
    }

    /// Builds the stack, recording batch latency into `latency`.
    pub fn build(self, latency: Histogram) -> ResilientExporter<E> {
        let retrying = RetryingExporter::new(self.inner, self.retry_config.unwrap_or_default());
        let timed = TimedExporter::new(retrying, latency);
        let breaker = CircuitBreakerExporter::new(timed, self.circuit_config.unwrap_or_default());
        match self.state_gauge {
            Some(gauge) => breaker.with_state_gauge(gauge),
            None => breaker,
        }
    }
}
