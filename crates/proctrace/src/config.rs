//! Service configuration.
//!
//! Every option is a long flag with an environment variable fallback, so the
//! service runs unchanged from a container environment or a shell.

use crate::acceptor::AcceptorConfig;
use crate::batch_exporter::BatchExporterConfig;
use crate::batch_processor::BatchConfig;
use crate::correlation::InfluxConfig;
use crate::resilient_exporter::{CircuitBreakerConfig, RetryConfig};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use reqwest::Url;
use std::time::Duration;

/// Largest accepted BATCH_SIZE.
pub const MAX_BATCH_SIZE: usize = 1_000_000;

/// Largest accepted QUEUE_MAXSIZE, the most a bounded channel can hold.
pub const MAX_QUEUE_SIZE: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Configuration errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Parses a non-negative number of seconds, fractions allowed.
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("`{value}` is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("`{value}` is not a valid duration"))
}

/// Telemetry ingestion pipeline: TCP line-delimited JSON in, OTLP/HTTP out.
#[derive(Parser, Debug, Clone)]
#[command(name = "proctrace", version, about, long_about = None)]
pub struct Config {
    /// Ingest bind host
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Ingest bind port
    #[arg(long, env = "LISTEN_PORT", default_value_t = 5000)]
    pub listen_port: u16,

    /// Metrics endpoint bind host
    #[arg(long, env = "METRICS_HOST", default_value = "0.0.0.0")]
    pub metrics_host: String,

    /// Metrics endpoint bind port
    #[arg(long, env = "METRICS_PORT", default_value_t = 8000)]
    pub metrics_port: u16,

    /// OTLP/HTTP traces endpoint
    #[arg(long, env = "OTLP_ENDPOINT", default_value = "http://jaeger:4318/v1/traces")]
    pub otlp_endpoint: String,

    /// Number of record workers
    #[arg(long, env = "WORKER_COUNT", default_value_t = 8)]
    pub worker_count: usize,

    /// Maximum spans per batch
    #[arg(long, env = "BATCH_SIZE", default_value_t = 200)]
    pub batch_size: usize,

    /// Seconds a batch stays open after its first span
    #[arg(long, env = "BATCH_TIMEOUT", default_value = "0.2", value_parser = parse_seconds)]
    pub batch_timeout: Duration,

    /// Capacity of the ingest and span queues
    #[arg(long, env = "QUEUE_MAXSIZE", default_value_t = 10_000)]
    pub queue_maxsize: usize,

    /// Per-request HTTP timeout in seconds
    #[arg(long, env = "EXPORT_TIMEOUT", default_value = "5", value_parser = parse_seconds)]
    pub export_timeout: Duration,

    /// Attempts per batch, first attempt included
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    /// Seconds before the first retry
    #[arg(long, env = "RETRY_MIN_WAIT", default_value = "1", value_parser = parse_seconds)]
    pub retry_min_wait: Duration,

    /// Upper bound on the wait between retries, in seconds
    #[arg(long, env = "RETRY_MAX_WAIT", default_value = "10", value_parser = parse_seconds)]
    pub retry_max_wait: Duration,

    /// Growth factor of the retry wait
    #[arg(long, env = "RETRY_MULTIPLIER", default_value_t = 2.0)]
    pub retry_multiplier: f64,

    /// Consecutive failed batches before the circuit opens
    #[arg(long, env = "BREAKER_FAIL_MAX", default_value_t = 5)]
    pub breaker_fail_max: u32,

    /// Seconds the circuit stays open before a trial export
    #[arg(long, env = "BREAKER_RESET_TIMEOUT", default_value = "30", value_parser = parse_seconds)]
    pub breaker_reset_timeout: Duration,

    /// Write session to trace correlation points after each sent batch
    #[arg(
        long,
        env = "CORRELATION_ENABLED",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub correlation_enabled: bool,

    /// Time-series sink base URL
    #[arg(long, env = "INFLUX_URL", default_value = "http://victoriametrics:8428")]
    pub influx_url: String,

    /// Time-series sink token
    #[arg(long, env = "INFLUX_TOKEN", default_value = "", hide_env_values = true)]
    pub influx_token: String,

    /// Time-series sink organisation
    #[arg(long, env = "INFLUX_ORG", default_value = "")]
    pub influx_org: String,

    /// Time-series sink bucket
    #[arg(long, env = "INFLUX_BUCKET", default_value = "traces")]
    pub influx_bucket: String,

    /// Prefix for the correlation measurement names
    #[arg(long, env = "CORRELATION_MEASUREMENT_PREFIX", default_value = "")]
    pub correlation_measurement_prefix: String,

    /// Seconds an idle worker or exporter waits before checking for shutdown
    #[arg(long, env = "POLL_INTERVAL", default_value = "1", value_parser = parse_seconds)]
    pub poll_interval: Duration,

    /// Verbose logging
    #[arg(
        long,
        env = "DEBUG_MODE",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub debug_mode: bool,
}

impl Config {
    /// Checks the values clap cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("BATCH_SIZE", "must be at least 1"));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(invalid("BATCH_SIZE", format!("must be at most {MAX_BATCH_SIZE}")));
        }
        if self.batch_timeout.is_zero() {
            return Err(invalid("BATCH_TIMEOUT", "must be positive"));
        }
        if self.queue_maxsize == 0 {
            return Err(invalid("QUEUE_MAXSIZE", "must be at least 1"));
        }
        if self.queue_maxsize > MAX_QUEUE_SIZE {
            return Err(invalid("QUEUE_MAXSIZE", format!("must be at most {MAX_QUEUE_SIZE}")));
        }
        if self.retry_max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.retry_max_wait < self.retry_min_wait {
            return Err(invalid("RETRY_MAX_WAIT", "must not be below RETRY_MIN_WAIT"));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(invalid("RETRY_MULTIPLIER", "must be a finite number >= 1"));
        }
        if self.breaker_fail_max == 0 {
            return Err(invalid("BREAKER_FAIL_MAX", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("POLL_INTERVAL", "must be positive"));
        }
        check_http_url("OTLP_ENDPOINT", &self.otlp_endpoint)?;
        if self.correlation_enabled {
            check_http_url("INFLUX_URL", &self.influx_url)?;
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn metrics_address(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }

    pub fn acceptor_config(&self) -> AcceptorConfig {
        AcceptorConfig::default()
    }

    pub fn batch_exporter_config(&self) -> BatchExporterConfig {
        BatchExporterConfig {
            batch: BatchConfig {
                batch_size_limit: self.batch_size,
                batch_timeout: self.batch_timeout,
            },
            poll_interval: self.poll_interval,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_max_attempts.saturating_sub(1),
            initial_delay: self.retry_min_wait,
            max_delay: self.retry_max_wait,
            backoff_multiplier: self.retry_multiplier,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_fail_max,
            reset_timeout: self.breaker_reset_timeout,
        }
    }

    /// Sink settings, or `None` when correlation is disabled.
    pub fn influx_config(&self) -> Option<InfluxConfig> {
        self.correlation_enabled.then(|| InfluxConfig {
            url: self.influx_url.clone(),
            token: self.influx_token.clone(),
            org: self.influx_org.clone(),
            bucket: self.influx_bucket.clone(),
            measurement_prefix: self.correlation_measurement_prefix.clone(),
            timeout: self.export_timeout,
        })
    }
}

fn check_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| invalid(field, format!("`{value}`: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(field, format!("unsupported scheme `{other}`"))),
    }
}
