//! Telemetry Event Types
//!
//! `RawEvent` is whatever the external source delivers; `TelemetryEvent`
//! is the normalized, immutable value the core matches and windows on.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{MAX_EVENT_FIELD_LEN, MAX_EVENT_FUTURE_SKEW_MS};

// ============================================================================
// RAW EVENT
// ============================================================================

/// Event record as delivered by the agent / kernel source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default, alias = "process")]
    pub subject: Option<String>,
    #[serde(default, alias = "op")]
    pub action: Option<String>,
    #[serde(default, alias = "path")]
    pub target: Option<String>,
    /// Unix milliseconds; filled with ingest time when absent
    #[serde(default, alias = "ts")]
    pub timestamp: Option<i64>,
    /// Source-specific fields the core does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawEvent {
    pub fn new(subject: &str, action: &str, target: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            action: Some(action.to_string()),
            target: Some(target.to_string()),
            ..Default::default()
        }
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }
}

// ============================================================================
// TELEMETRY EVENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Ingest sequence number, unique per pipeline
    pub seq: u64,
    pub subject: String,
    pub action: String,
    pub target: String,
    pub timestamp_ms: i64,
}

impl TelemetryEvent {
    pub fn new(seq: u64, subject: &str, action: &str, target: &str, timestamp_ms: i64) -> Self {
        Self {
            seq,
            subject: subject.to_string(),
            action: action.to_string(),
            target: target.to_string(),
            timestamp_ms,
        }
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Schema violation. The event is dropped and counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is {len} bytes, limit {}", MAX_EVENT_FIELD_LEN)]
    FieldTooLong { field: &'static str, len: usize },

    #[error("timestamp {0} is out of range")]
    BadTimestamp(i64),

    #[error("undecodable event: {0}")]
    Decode(String),
}

/// Validate and normalize a raw record
pub fn normalize(raw: RawEvent, seq: u64) -> Result<TelemetryEvent, MalformedEvent> {
    normalize_at(raw, seq, Utc::now().timestamp_millis())
}

pub fn normalize_at(raw: RawEvent, seq: u64, now_ms: i64) -> Result<TelemetryEvent, MalformedEvent> {
    let subject = required("subject", raw.subject)?;
    let action = required("action", raw.action)?.to_ascii_lowercase();
    let target = required("target", raw.target)?;

    let timestamp_ms = match raw.timestamp {
        Some(ts) if ts < 0 || ts > now_ms + MAX_EVENT_FUTURE_SKEW_MS => {
            return Err(MalformedEvent::BadTimestamp(ts));
        }
        Some(ts) => ts,
        None => now_ms,
    };

    Ok(TelemetryEvent {
        seq,
        subject,
        action,
        target,
        timestamp_ms,
    })
}

/// Decode one JSON record
pub fn decode(bytes: &[u8]) -> Result<RawEvent, MalformedEvent> {
    serde_json::from_slice(bytes).map_err(|e| MalformedEvent::Decode(e.to_string()))
}

fn required(field: &'static str, value: Option<String>) -> Result<String, MalformedEvent> {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    if value.is_empty() {
        return Err(MalformedEvent::MissingField(field));
    }
    if value.len() > MAX_EVENT_FIELD_LEN {
        return Err(MalformedEvent::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_normalize_trims_and_lowercases_action() {
        let ev = normalize_at(RawEvent::new(" bash ", "OPEN", "/etc/Shadow").at(NOW - 5), 7, NOW).unwrap();
        assert_eq!(ev.subject, "bash");
        assert_eq!(ev.action, "open");
        assert_eq!(ev.target, "/etc/Shadow");
        assert_eq!(ev.timestamp_ms, NOW - 5);
        assert_eq!(ev.seq, 7);
    }

    #[test]
    fn test_missing_timestamp_uses_ingest_time() {
        let ev = normalize_at(RawEvent::new("a", "b", "c"), 1, NOW).unwrap();
        assert_eq!(ev.timestamp_ms, NOW);
    }

    #[test]
    fn test_schema_violations() {
        let mut raw = RawEvent::new("a", "b", "c");
        raw.target = None;
        assert_eq!(
            normalize_at(raw, 1, NOW).unwrap_err(),
            MalformedEvent::MissingField("target")
        );

        assert_eq!(
            normalize_at(RawEvent::new("  ", "b", "c"), 1, NOW).unwrap_err(),
            MalformedEvent::MissingField("subject")
        );

        let long = "x".repeat(MAX_EVENT_FIELD_LEN + 1);
        assert!(matches!(
            normalize_at(RawEvent::new(&long, "b", "c"), 1, NOW),
            Err(MalformedEvent::FieldTooLong { field: "subject", .. })
        ));

        assert_eq!(
            normalize_at(RawEvent::new("a", "b", "c").at(-1), 1, NOW).unwrap_err(),
            MalformedEvent::BadTimestamp(-1)
        );
        let future = NOW + MAX_EVENT_FUTURE_SKEW_MS + 1;
        assert_eq!(
            normalize_at(RawEvent::new("a", "b", "c").at(future), 1, NOW).unwrap_err(),
            MalformedEvent::BadTimestamp(future)
        );
    }

    #[test]
    fn test_decode_with_aliases_and_extra_fields() {
        let raw = decode(br#"{"process":"curl","op":"connect","path":"10.0.0.1:443","ts":5,"pid":99}"#).unwrap();
        assert_eq!(raw.subject.as_deref(), Some("curl"));
        assert_eq!(raw.target.as_deref(), Some("10.0.0.1:443"));
        assert_eq!(raw.timestamp, Some(5));
        assert_eq!(raw.extra["pid"], 99);

        assert!(matches!(decode(b"[1,2"), Err(MalformedEvent::Decode(_))));
    }
}
