//! Span export transports.
//!
//! [`SpanExporter`] is the seam between the batch exporter and a collector;
//! retry, timing and breaking are layered on top of it in `resilient_exporter`.

use crate::otlp;
use crate::span::SpanBatch;
use reqwest::header::CONTENT_TYPE;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Why a batch was not delivered.
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Connect, TLS or connection failure
    #[error("collector unreachable: {0}")]
    Transport(String),
    /// The collector answered with a non-2xx status
    #[error("collector responded with HTTP {0}")]
    Status(u16),
    #[error("failed to encode batch: {0}")]
    Serialization(String),
    #[error("all retry attempts exhausted after {attempts} tries (last error: {last_error})")]
    RetriesExhausted { attempts: u32, last_error: String },
    /// The request outlived the per-request timeout
    #[error("collector request timed out")]
    Timeout,
    /// Rejected locally while the breaker is open
    #[error("circuit breaker open, batch not sent")]
    CircuitOpen,
}

/// Delivers span batches somewhere.
///
/// The batch is borrowed so wrappers can re-send it and the caller still has
/// it for correlation after a successful export. The `impl Future` return is
/// not object-safe; store exporters as `dyn SpanExporterBoxed`.
pub trait SpanExporter: Send + Sync {
    /// Sends one batch. `Ok` means the receiver accepted it.
    fn export(&self, batch: &SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// [`SpanExporter`] with a boxed future, usable behind `dyn`.
pub trait SpanExporterBoxed: Send + Sync {
    fn export_boxed<'a>(
        &'a self,
        batch: &'a SpanBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

    fn name(&self) -> &str;
}

impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed<'a>(
        &'a self,
        batch: &'a SpanBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Exporter that POSTs OTLP/JSON payloads to a collector's `/v1/traces` endpoint.
///
/// This is the bare transport: a single request per call. Retry, timing and
/// circuit breaking are layered on top (see `resilient_exporter`).
pub struct OtlpHttpExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl OtlpHttpExporter {
    /// Creates an exporter for `endpoint` with a per-request timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExportError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Creates an exporter that shares an existing client.
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Target URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl SpanExporter for OtlpHttpExporter {
    async fn export(&self, batch: &SpanBatch) -> Result<(), ExportError> {
        let body =
            otlp::encode_batch(batch).map_err(|e| ExportError::Serialization(e.to_string()))?;

        tracing::debug!(
            spans = batch.len(),
            bytes = body.len(),
            endpoint = %self.endpoint,
            "posting OTLP payload"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExportError::Timeout
                } else {
                    ExportError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status(status.as_u16()));
        }

        tracing::debug!(status = status.as_u16(), "batch accepted by collector");
        Ok(())
    }

    fn name(&self) -> &str {
        "otlp_http"
    }
}

/// Keeps every batch it is given.
#[cfg(test)]
pub struct RecordingExporter {
    batches: std::sync::Mutex<Vec<Vec<crate::span::Span>>>,
}

#[cfg(test)]
impl Default for RecordingExporter {
    fn default() -> Self {
        Self {
            batches: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl RecordingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn span_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn spans(&self) -> Vec<crate::span::Span> {
        self.batches.lock().unwrap().concat()
    }
}

#[cfg(test)]
impl SpanExporter for RecordingExporter {
    async fn export(&self, batch: &SpanBatch) -> Result<(), ExportError> {
        self.batches.lock().unwrap().push(batch.spans.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}
