//! OTLP/HTTP JSON payload encoding.
//!
//! Spans are grouped into one `resourceSpans` entry per distinct
//! `service.name`, in order of first appearance, each holding a single
//! `scopeSpans` entry. Span order within a group follows batch order.

use crate::span::{AttributeValue, Span, SpanBatch};
use serde::Serialize;

/// Instrumentation scope reported for every exported span.
pub const SCOPE_NAME: &str = env!("CARGO_PKG_NAME");

/// OTLP `SPAN_KIND_INTERNAL`; process spans have no remote side.
pub const SPAN_KIND_INTERNAL: u8 = 1;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceServiceRequest<'a> {
    pub resource_spans: Vec<ResourceSpans<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans<'a> {
    pub resource: Resource<'a>,
    pub scope_spans: Vec<ScopeSpans<'a>>,
}

#[derive(Debug, Serialize)]
pub struct Resource<'a> {
    pub attributes: Vec<KeyValue<'a>>,
}

#[derive(Debug, Serialize)]
pub struct ScopeSpans<'a> {
    pub scope: InstrumentationScope,
    pub spans: Vec<OtlpSpan<'a>>,
}

#[derive(Debug, Serialize)]
pub struct InstrumentationScope {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan<'a> {
    pub trace_id: &'a str,
    pub span_id: String,
    pub parent_span_id: String,
    pub name: &'a str,
    pub kind: u8,
    /// fixed64 fields travel as decimal strings in OTLP/JSON
    pub start_time_unix_nano: String,
    pub end_time_unix_nano: String,
    pub attributes: Vec<KeyValue<'a>>,
}

#[derive(Debug, Serialize)]
pub struct KeyValue<'a> {
    pub key: &'a str,
    pub value: AnyValue<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue<'a> {
    StringValue(&'a str),
    IntValue(i64),
    DoubleValue(f64),
}

impl<'a> From<&'a AttributeValue> for AnyValue<'a> {
    fn from(value: &'a AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => AnyValue::StringValue(s),
            AttributeValue::Int(i) => AnyValue::IntValue(*i),
            AttributeValue::Double(d) => AnyValue::DoubleValue(*d),
        }
    }
}

impl<'a> From<&'a Span> for OtlpSpan<'a> {
    fn from(span: &'a Span) -> Self {
        Self {
            trace_id: &span.trace_id,
            span_id: span.span_id_hex(),
            parent_span_id: span.parent_span_id_hex(),
            name: &span.name,
            kind: SPAN_KIND_INTERNAL,
            start_time_unix_nano: span.start_time.to_string(),
            end_time_unix_nano: span.end_time.to_string(),
            attributes: span
                .attributes
                .iter()
                .map(|(key, value)| KeyValue {
                    key,
                    value: value.into(),
                })
                .collect(),
        }
    }
}

/// Builds the export request for a slice of spans.
pub fn build_request(spans: &[Span]) -> ExportTraceServiceRequest<'_> {
    let mut resource_spans: Vec<ResourceSpans<'_>> = Vec::new();
    let mut services: Vec<&str> = Vec::new();

    for span in spans {
        let index = match services.iter().position(|s| *s == span.service_name) {
            Some(index) => index,
            None => {
                services.push(&span.service_name);
                resource_spans.push(ResourceSpans {
                    resource: Resource {
                        attributes: vec![KeyValue {
                            key: "service.name",
                            value: AnyValue::StringValue(&span.service_name),
                        }],
                    },
                    scope_spans: vec![ScopeSpans {
                        scope: InstrumentationScope {
                            name: SCOPE_NAME,
                            version: env!("CARGO_PKG_VERSION"),
                        },
                        spans: Vec::new(),
                    }],
                });
                resource_spans.len() - 1
            }
        };
        resource_spans[index].scope_spans[0].spans.push(span.into());
    }

    ExportTraceServiceRequest { resource_spans }
}

/// Serializes a batch into the JSON request body.
pub fn encode_batch(batch: &SpanBatch) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&build_request(&batch.spans))
}
