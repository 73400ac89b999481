//! Span Builder
//!
//! Pure derivation of a [`Span`] from a [`TelemetryRecord`]. The only input
//! besides the record is the wall-clock reading, passed in so the derivation
//! stays deterministic under test.
//!
//! # Identifier derivation
//!
//! - `span_id` is the process id, rendered as 16 zero-padded hex digits.
//! - `parent_span_id` is the parent process id, or empty when it is zero.
//! - `trace_id` is `1` (logon) or `2` (logoff) followed by the session guid
//!   with dashes removed, right-padded with `0` and cut to 32 characters. Both
//!   events of one session therefore land in two distinct traces, and the
//!   leading digit tells a consumer which event a trace belongs to.
//!
//! # Timestamps
//!
//! Records only carry offsets relative to session start, so the span is anchored
//! to the current wall-clock second: `start = now_secs * 1e9 + start_offset_ms * 1e6`
//! and `end = start + lifetime_ms * 1e6`.

use crate::record::{EventType, TelemetryRecord};
use crate::span::{AttributeValue, Span};
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of a trace id in hex characters.
pub const TRACE_ID_LEN: usize = 32;

const NANOS_PER_SEC: i128 = 1_000_000_000;
const NANOS_PER_MILLI: i128 = 1_000_000;

const UNKNOWN_SPAN: &str = "unknown-span";
const UNKNOWN_SERVICE: &str = "unknown-service";
const UNKNOWN_USER: &str = "unknown-user";

/// Derives the trace id for a session event.
pub fn derive_trace_id(session_guid: &str, event_type: EventType) -> String {
    let mut trace_id = String::with_capacity(TRACE_ID_LEN);
    trace_id.push(event_type.trace_prefix());
    trace_id.extend(
        session_guid
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .take(TRACE_ID_LEN - 1),
    );
    // Multi-byte chars in a malformed guid could overshoot the byte length
    while trace_id.len() > TRACE_ID_LEN {
        trace_id.pop();
    }
    while trace_id.len() < TRACE_ID_LEN {
        trace_id.push('0');
    }
    trace_id
}

/// Builds the span for one record, anchored at `now`.
pub fn build_span(record: &TelemetryRecord, now: SystemTime) -> Span {
    let event_type = record.event_type();
    let session_guid = record.session_guid().to_string();

    let epoch_secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let start = i128::from(epoch_secs) * NANOS_PER_SEC
        + i128::from(record.proc_start_time_relative_ms) * NANOS_PER_MILLI;
    let end = start + i128::from(record.proc_lifetime_ms) * NANOS_PER_MILLI;

    Span {
        trace_id: derive_trace_id(&session_guid, event_type),
        span_id: record.proc_id,
        parent_span_id: record.proc_parent_id,
        start_time: clamp_nanos(start),
        end_time: clamp_nanos(end),
        name: or_placeholder(record.proc_name.as_deref(), UNKNOWN_SPAN),
        service_name: service_name(record),
        attributes: attributes(record, event_type),
        session_guid,
        event_type,
    }
}

fn clamp_nanos(nanos: i128) -> u64 {
    nanos.clamp(0, i128::from(u64::MAX)) as u64
}

fn or_placeholder(value: Option<&str>, fallback: &str) -> String {
    value.unwrap_or(fallback).to_string()
}

/// Logoff records report the process type under `LogoffProcType`.
fn service_name(record: &TelemetryRecord) -> String {
    let logon = record.logon_proc_type.as_deref();
    let chosen = match record.logoff_proc_type.as_deref() {
        Some(logoff) if !logoff.is_empty() => Some(logoff),
        _ => logon,
    };
    or_placeholder(chosen, UNKNOWN_SERVICE)
}

fn attributes(record: &TelemetryRecord, event_type: EventType) -> Vec<(String, AttributeValue)> {
    use AttributeValue::{Double, Int, String as Str};

    let user = or_placeholder(record.proc_user.as_deref(), UNKNOWN_USER);
    vec![
        ("ProcUser".into(), Str(user)),
        ("ProcCPUTimeMs".into(), Int(record.proc_cpu_time_ms)),
        ("ProcWorkingSetMB".into(), Double(record.proc_working_set_mb)),
        ("ProcNetKBPS".into(), Double(record.proc_net_kbps)),
        ("ProcIOReadCount".into(), Int(record.proc_io_read_count)),
        ("ProcIOWriteCount".into(), Int(record.proc_io_write_count)),
        ("ProcIOReadMB".into(), Double(record.proc_io_read_mb.trunc())),
        ("ProcIOWriteMB".into(), Double(record.proc_io_write_mb.trunc())),
        ("ProcIOLatencyReadMs2".into(), Int(record.proc_io_latency_read_ms2)),
        ("ProcIOLatencyWriteMs2".into(), Int(record.proc_io_latency_write_ms2)),
        ("ProcLifetimeMs".into(), Int(record.proc_lifetime_ms)),
        ("event_type".into(), Str(event_type.as_str().to_string())),
    ]
}
