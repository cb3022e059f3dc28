//! Sysmon payload parser
//!
//! Converts a raw winlogbeat JSON message into a normalized [`Event`].
//! The Sysmon `UtcTime` field is authoritative for the event timestamp;
//! the envelope `@timestamp` is only a fallback when `UtcTime` is absent.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::models::Event;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a json object")]
    NotAnObject,
}

/// Parses one raw queue payload into a normalized event.
pub fn parse(payload: &[u8]) -> Result<Event, ParseError> {
    let raw: Value = serde_json::from_slice(payload)?;
    let root = raw.as_object().ok_or(ParseError::NotAnObject)?;

    let mut event = Event::default();

    if let Some(ts) = get_string(root, &["@timestamp"]) {
        event.ts = parse_rfc3339(&ts);
    }

    event.event_id = get_u32(root, &["winlog.event_id", "event.code", "event_id"]);
    event.agent_id = get_string(root, &["agent.id", "agent_id"]).unwrap_or_default();
    event.hostname =
        get_string(root, &["host.name", "host.hostname", "hostname"]).unwrap_or_default();
    event.channel = get_string(root, &["winlog.channel"]).unwrap_or_default();
    event.record_id = get_string(root, &["winlog.record_id"]).unwrap_or_default();

    if let Some(Value::Object(fields)) = get_path(root, "winlog.event_data") {
        event.fields = fields.clone();
    }
    if event.fields.is_empty() {
        warn!(
            event_id = event.event_id,
            record_id = %event.record_id,
            "Missing winlog.event_data"
        );
    }

    // UtcTime overrides the envelope timestamp. A present but unparseable
    // UtcTime invalidates the timestamp so the mapper drops the event.
    let utc_time = event.field("UtcTime");
    if !utc_time.is_empty() {
        event.ts = parse_utc_time(&utc_time);
    }

    Ok(event)
}

/// Parses RFC3339 (with or without fractional seconds).
fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parses the Sysmon UtcTime formats: RFC3339, or the whitespace-separated
/// `2026-02-01 10:00:00.123` variant with up to nine fractional digits,
/// interpreted as UTC.
fn parse_utc_time(value: &str) -> Option<DateTime<Utc>> {
    if let Some(ts) = parse_rfc3339(value) {
        return Some(ts);
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

/// Walks a dotted path through nested objects.
fn get_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut current: &Value = root.get(path.split('.').next()?)?;
    for part in path.split('.').skip(1) {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn get_string(root: &Map<String, Value>, paths: &[&str]) -> Option<String> {
    for path in paths {
        match get_path(root, path) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i.to_string());
                }
                if let Some(u) = n.as_u64() {
                    return Some(u.to_string());
                }
                if let Some(f) = n.as_f64() {
                    if f.is_finite() && f == f.trunc() {
                        return Some((f as i64).to_string());
                    }
                    return Some(f.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn get_u32(root: &Map<String, Value>, paths: &[&str]) -> u32 {
    for path in paths {
        match get_path(root, path) {
            Some(Value::Number(n)) => {
                if let Some(u) = n.as_u64() {
                    return u as u32;
                }
                if let Some(f) = n.as_f64() {
                    return f as u32;
                }
            }
            Some(Value::String(s)) if !s.is_empty() => {
                if let Ok(v) = s.trim().parse::<u32>() {
                    return v;
                }
            }
            _ => {}
        }
    }
    0
}
