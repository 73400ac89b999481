//! Telemetry Record Decoding
//!
//! One line on the ingest socket carries one JSON object describing a process
//! observed during a user session. Every field is optional: numeric fields
//! fall back to `0` and string fields to `None`, so a sparse record still
//! yields a span. Numbers are accepted leniently (integers, floats and numeric
//! strings) because agents in the field are not consistent about it.
//!
//! The presence of `LogoffProcType` (even with a `null` value) turns the record
//! into a logoff event; everything else is a logon event.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// Error types for record decoding.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The line is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The line is valid JSON but not an object.
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// Session event a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Logon,
    Logoff,
}

impl EventType {
    /// Value of the `event_type` span attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Logon => "logon",
            EventType::Logoff => "logoff",
        }
    }

    /// Leading hex digit of every trace id derived for this event type.
    pub fn trace_prefix(self) -> char {
        match self {
            EventType::Logon => '1',
            EventType::Logoff => '2',
        }
    }
}

/// A decoded process/session telemetry record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetryRecord {
    #[serde(rename = "SessionGUID", deserialize_with = "lenient_string")]
    pub session_guid: Option<String>,
    #[serde(rename = "ProcID", deserialize_with = "lenient_u64")]
    pub proc_id: u64,
    #[serde(rename = "ProcParentID", deserialize_with = "lenient_u64")]
    pub proc_parent_id: u64,
    #[serde(rename = "ProcStartTimeRelativeMs", deserialize_with = "lenient_i64")]
    pub proc_start_time_relative_ms: i64,
    #[serde(rename = "ProcLifetimeMs", deserialize_with = "lenient_i64")]
    pub proc_lifetime_ms: i64,
    #[serde(rename = "ProcCPUTimeMs", deserialize_with = "lenient_i64")]
    pub proc_cpu_time_ms: i64,
    #[serde(rename = "ProcWorkingSetMB", deserialize_with = "lenient_f64")]
    pub proc_working_set_mb: f64,
    #[serde(rename = "ProcNetKBPS", deserialize_with = "lenient_f64")]
    pub proc_net_kbps: f64,
    #[serde(rename = "ProcIOReadCount", deserialize_with = "lenient_i64")]
    pub proc_io_read_count: i64,
    #[serde(rename = "ProcIOWriteCount", deserialize_with = "lenient_i64")]
    pub proc_io_write_count: i64,
    #[serde(rename = "ProcIOReadMB", deserialize_with = "lenient_f64")]
    pub proc_io_read_mb: f64,
    #[serde(rename = "ProcIOWriteMB", deserialize_with = "lenient_f64")]
    pub proc_io_write_mb: f64,
    #[serde(rename = "ProcIOLatencyReadMs2", deserialize_with = "lenient_i64")]
    pub proc_io_latency_read_ms2: i64,
    #[serde(rename = "ProcIOLatencyWriteMs2", deserialize_with = "lenient_i64")]
    pub proc_io_latency_write_ms2: i64,
    #[serde(rename = "ProcName", deserialize_with = "lenient_string")]
    pub proc_name: Option<String>,
    #[serde(rename = "ProcUser", deserialize_with = "lenient_string")]
    pub proc_user: Option<String>,
    #[serde(rename = "LogonProcType", deserialize_with = "lenient_string")]
    pub logon_proc_type: Option<String>,
    /// `Some` whenever the key is present; a `null` value becomes `Some("")`.
    #[serde(rename = "LogoffProcType", deserialize_with = "presence_string")]
    pub logoff_proc_type: Option<String>,
}

impl TelemetryRecord {
    /// Decodes one raw line.
    pub fn from_slice(line: &[u8]) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_slice(line)?;
        match value {
            Value::Object(_) => Ok(Self::deserialize(value)?),
            other => Err(RecordError::NotAnObject(json_kind(&other))),
        }
    }

    /// Returns `true` if this record marks the end of a session.
    pub fn is_logoff(&self) -> bool {
        self.logoff_proc_type.is_some()
    }

    /// Session event this record belongs to.
    pub fn event_type(&self) -> EventType {
        if self.is_logoff() {
            EventType::Logoff
        } else {
            EventType::Logon
        }
    }

    /// Session identifier, empty when absent.
    pub fn session_guid(&self) -> &str {
        self.session_guid.as_deref().unwrap_or_default()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn value_as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
                .unwrap_or(0)
        }
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

fn value_as_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or_else(|| value_as_i64(value).max(0) as u64),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .unwrap_or_else(|_| value_as_i64(value).max(0) as u64),
        _ => value_as_i64(value).max(0) as u64,
    }
}

fn value_as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .unwrap_or(0.0),
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

fn value_as_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(value_as_i64(&Value::deserialize(deserializer)?))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(value_as_u64(&Value::deserialize(deserializer)?))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(value_as_f64(&Value::deserialize(deserializer)?))
}

fn lenient_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(value_as_string(Value::deserialize(deserializer)?))
}

fn presence_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Some(
        value_as_string(Value::deserialize(deserializer)?).unwrap_or_default(),
    ))
}
