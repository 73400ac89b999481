//! Span model shared by the builder, the exporter and correlation.

use crate::record::EventType;
use std::time::SystemTime;

/// One process observation, as exported to the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    /// 32 lowercase hex chars, see `span_builder::derive_trace_id`
    pub trace_id: String,
    /// The process id
    pub span_id: u64,
    /// The parent process id, 0 for none
    pub parent_span_id: u64,
    /// Unix nanoseconds
    pub start_time: u64,
    /// Unix nanoseconds
    pub end_time: u64,
    /// Process name
    pub name: String,
    /// Value of the `service.name` resource attribute
    pub service_name: String,
    /// Typed attributes, in wire order
    pub attributes: Vec<(String, AttributeValue)>,
    /// Kept for correlation after export
    pub session_guid: String,
    pub event_type: EventType,
}

/// Typed attribute value; maps to OTLP `stringValue`/`intValue`/`doubleValue`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(f64),
}

/// Spans sent to the collector in one request.
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// In dequeue order
    pub spans: Vec<Span>,
    /// When the batch was cut
    pub timestamp: SystemTime,
}

impl Span {
    /// Span id as 16 lowercase hex digits.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }

    /// Parent span id as 16 lowercase hex digits, empty for a root span.
    pub fn parent_span_id_hex(&self) -> String {
        if self.parent_span_id == 0 {
            String::new()
        } else {
            format!("{:016x}", self.parent_span_id)
        }
    }

    /// Looks up an attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// `end_time - start_time`, saturating at 0.
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

impl SpanBatch {
    /// Wraps `spans`, stamped with the current time.
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start_time: u64, end_time: u64) -> Span {
        Span {
            trace_id: "1".repeat(32),
            span_id: 255,
            parent_span_id: 0,
            start_time,
            end_time,
            name: "cmd.exe".into(),
            service_name: "svc".into(),
            attributes: vec![("ProcCPUTimeMs".into(), AttributeValue::Int(3))],
            session_guid: String::new(),
            event_type: EventType::Logon,
        }
    }

    #[test]
    fn test_duration_saturates() {
        assert_eq!(span(10, 25).duration_nanos(), 15);
        assert_eq!(span(25, 10).duration_nanos(), 0);
    }

    #[test]
    fn test_batch_stamps_and_counts() {
        let before = SystemTime::now();
        let batch = SpanBatch::with_spans(vec![span(0, 1), span(1, 2)]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert!(batch.timestamp >= before);
        assert!(SpanBatch::with_spans(Vec::new()).is_empty());
    }
}
