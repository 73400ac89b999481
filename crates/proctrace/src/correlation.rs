//! Session to trace correlation.
//!
//! After a batch has been accepted by the collector, every distinct session
//! guid in it is written to a time-series store together with the trace id
//! its spans were exported under. The points carry no measurement value of
//! interest (`value=0i`); the tags are the payload, so a dashboard can jump
//! from a session to its logon or logoff trace.
//!
//! Writes are fire-and-forget from the pipeline's point of view: a failed write
//! is reported to the caller, logged and counted, but never retried and never
//! turns a sent batch into a failed one.

use crate::span::SpanBatch;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Measurement for sessions whose trace id carries the logon prefix.
pub const LOGON_MEASUREMENT: &str = "logonTraceMap";
/// Measurement for every other trace id.
pub const LOGOFF_MEASUREMENT: &str = "logoffTraceMap";

/// Error types for correlation sink writes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Transport-layer error (connect, timeout, broken connection)
    #[error("transport error: {0}")]
    Transport(String),
    /// The sink answered with a non-2xx status
    #[error("sink responded with HTTP {0}")]
    Status(u16),
}

/// One `(guid, trace_id)` association at collection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationPoint {
    pub guid: String,
    pub trace_id: String,
    /// Unix nanoseconds
    pub timestamp_ns: u64,
}

impl CorrelationPoint {
    /// Measurement name, chosen by the trace id's event prefix.
    pub fn measurement(&self) -> &'static str {
        if self.trace_id.starts_with('1') {
            LOGON_MEASUREMENT
        } else {
            LOGOFF_MEASUREMENT
        }
    }
}

/// Derives one point per unique, non-empty session guid in `batch`.
///
/// Points come out in order of each guid's first appearance; when a guid shows
/// up with more than one trace id the last one wins.
pub fn correlation_points(batch: &SpanBatch, timestamp_ns: u64) -> Vec<CorrelationPoint> {
    let mut points: Vec<CorrelationPoint> = Vec::new();
    for span in &batch.spans {
        if span.session_guid.is_empty() || span.trace_id.is_empty() {
            continue;
        }
        match points.iter_mut().find(|p| p.guid == span.session_guid) {
            Some(point) => point.trace_id.clone_from(&span.trace_id),
            None => points.push(CorrelationPoint {
                guid: span.session_guid.clone(),
                trace_id: span.trace_id.clone(),
                timestamp_ns,
            }),
        }
    }
    points
}

/// Current wall-clock time in Unix nanoseconds.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Destination for correlation points.
pub trait CorrelationSink: Send + Sync {
    /// Writes all points in one request.
    fn write(
        &self,
        points: &[CorrelationPoint],
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Returns the sink name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`CorrelationSink`].
pub trait CorrelationSinkBoxed: Send + Sync {
    fn write_boxed<'a>(
        &'a self,
        points: &'a [CorrelationPoint],
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

    fn name(&self) -> &str;
}

impl<T: CorrelationSink> CorrelationSinkBoxed for T {
    fn write_boxed<'a>(
        &'a self,
        points: &'a [CorrelationPoint],
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(self.write(points))
    }

    fn name(&self) -> &str {
        CorrelationSink::name(self)
    }
}

/// Writes InfluxDB line protocol to `{url}/api/v2/write`.
///
/// VictoriaMetrics and InfluxDB 2.x both accept this endpoint.
pub struct InfluxLineSink {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
    measurement_prefix: String,
}

/// Connection settings for [`InfluxLineSink`].
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// Prepended verbatim to the measurement name
    pub measurement_prefix: String,
    pub timeout: Duration,
}

impl InfluxLineSink {
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org,
            bucket: config.bucket,
            token: config.token,
            measurement_prefix: config.measurement_prefix,
        })
    }

    /// Renders the request body, one line per point.
    pub fn encode(&self, points: &[CorrelationPoint]) -> String {
        let mut body = String::new();
        for point in points {
            let measurement = format!("{}{}", self.measurement_prefix, point.measurement());
            body.push_str(&escape_measurement(&measurement));
            body.push_str(",guid=");
            body.push_str(&escape_tag(&point.guid));
            body.push_str(",trace_id=");
            body.push_str(&escape_tag(&point.trace_id));
            body.push_str(" value=0i ");
            body.push_str(&point.timestamp_ns.to_string());
            body.push('\n');
        }
        body
    }
}

impl CorrelationSink for InfluxLineSink {
    async fn write(&self, points: &[CorrelationPoint]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(self.encode(points));
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Token {}", self.token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "influx"
    }
}

fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

fn escape_tag(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

/// Line breaks cannot be escaped in line protocol, so they become spaces
/// before escaping.
fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        let c = if matches!(c, '\n' | '\r') { ' ' } else { c };
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventType, TelemetryRecord};
    use crate::span_builder::build_span;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::{Router, routing::post};
    use std::sync::{Arc, Mutex};

    fn span(guid: &str, logoff: bool) -> crate::span::Span {
        let record = TelemetryRecord {
            session_guid: Some(guid.to_string()),
            logoff_proc_type: logoff.then(String::new),
            ..Default::default()
        };
        build_span(&record, SystemTime::now())
    }

    fn sink(url: &str, token: &str, prefix: &str) -> InfluxLineSink {
        InfluxLineSink::new(InfluxConfig {
            url: url.to_string(),
            token: token.to_string(),
            org: "acme".to_string(),
            bucket: "traces".to_string(),
            measurement_prefix: prefix.to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[test]
    fn test_unique_guids_first_seen_order() {
        let batch = SpanBatch::with_spans(vec![
            span("bbbb", false),
            span("aaaa", false),
            span("bbbb", false),
            span("", false),
        ]);
        let points = correlation_points(&batch, 42);

        let guids: Vec<&str> = points.iter().map(|p| p.guid.as_str()).collect();
        assert_eq!(guids, ["bbbb", "aaaa"]);
        assert!(points.iter().all(|p| p.timestamp_ns == 42));
    }

    #[test]
    fn test_last_trace_id_wins_per_guid() {
        let batch = SpanBatch::with_spans(vec![span("abcd", false), span("abcd", true)]);
        let points = correlation_points(&batch, 0);

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].trace_id, crate::span_builder::derive_trace_id("abcd", EventType::Logoff));
        assert_eq!(points[0].measurement(), LOGOFF_MEASUREMENT);
    }

    #[test]
    fn test_measurement_by_prefix() {
        let point = |trace_id: &str| CorrelationPoint {
            guid: "g".into(),
            trace_id: trace_id.into(),
            timestamp_ns: 0,
        };
        assert_eq!(point("1abc").measurement(), LOGON_MEASUREMENT);
        assert_eq!(point("2abc").measurement(), LOGOFF_MEASUREMENT);
        assert_eq!(point("f00d").measurement(), LOGOFF_MEASUREMENT);
    }

    #[test]
    fn test_line_protocol_encoding() {
        let sink = sink("http://localhost:8428/", "", "uberAgent:");
        let body = sink.encode(&[
            CorrelationPoint {
                guid: "ab-cd".into(),
                trace_id: "1abcd".into(),
                timestamp_ns: 1_700_000_000_000_000_000,
            },
            CorrelationPoint {
                guid: "odd guid,=x".into(),
                trace_id: "2ff".into(),
                timestamp_ns: 5,
            },
        ]);

        assert_eq!(
            body,
            "uberAgent:logonTraceMap,guid=ab-cd,trace_id=1abcd value=0i 1700000000000000000\n\
             uberAgent:logoffTraceMap,guid=odd\\ guid\\,\\=x,trace_id=2ff value=0i 5\n"
        );
        assert_eq!(sink.write_url, "http://localhost:8428/api/v2/write");

        let body = sink.encode(&[CorrelationPoint {
            guid: "abc\nevil value=1i 0\r".into(),
            trace_id: "1ab\ncd".into(),
            timestamp_ns: 7,
        }]);
        assert_eq!(body.lines().count(), 1);
        assert!(!body.contains('\r'));
        assert_eq!(
            body,
            "uberAgent:logonTraceMap,guid=abc\\ evil\\ value\\=1i\\ 0\\ ,trace_id=1ab\\ cd value=0i 7\n"
        );
    }

    type Captured = Arc<Mutex<Vec<(String, Option<String>, String)>>>;

    async fn sink_stub(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&captured);
        let app = Router::new().route(
            "/api/v2/write",
            post(move |uri: Uri, headers: HeaderMap, body: String| {
                let log = Arc::clone(&log);
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    log.lock()
                        .unwrap()
                        .push((uri.query().unwrap_or_default().to_string(), auth, body));
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), captured)
    }

    #[tokio::test]
    async fn test_influx_sink_writes_one_request() {
        let (url, captured) = sink_stub(StatusCode::NO_CONTENT).await;
        let sink = sink(&url, "secret", "");
        let batch = SpanBatch::with_spans(vec![span("s1", false), span("s2", true)]);

        sink.write(&correlation_points(&batch, 9)).await.unwrap();

        let requests = captured.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (query, auth, body) = &requests[0];
        assert_eq!(query, "org=acme&bucket=traces&precision=ns");
        assert_eq!(auth.as_deref(), Some("Token secret"));
        assert_eq!(body.lines().count(), 2);
        assert!(body.starts_with("logonTraceMap,guid=s1,"));
    }

    #[tokio::test]
    async fn test_influx_sink_skips_empty_writes() {
        let (url, captured) = sink_stub(StatusCode::NO_CONTENT).await;
        sink(&url, "", "").write(&[]).await.unwrap();
        assert!(captured.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_influx_sink_error_status() {
        let (url, _captured) = sink_stub(StatusCode::SERVICE_UNAVAILABLE).await;
        let point = CorrelationPoint {
            guid: "g".into(),
            trace_id: "1".into(),
            timestamp_ns: 1,
        };
        let result = sink(&url, "", "").write(&[point]).await;
        assert_eq!(result, Err(SinkError::Status(503)));
    }
}
