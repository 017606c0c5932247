use crate::{
    entry::{FieldValue, LogEntry, LogLevel},
    parse::{utf8, Parser, ParserError},
};
use chrono::{DateTime, TimeZone, Utc};
use std::str::FromStr;

/// Epoch values above this are taken to be nanoseconds rather than seconds.
const NANOS_THRESHOLD: i64 = 1_000_000_000_000;

/// Decodes a single JSON object into a log entry. Recognized top-level keys
/// are timestamp, level, message, logger, fields, labels, trace_id and
/// span_id; unknown top-level keys are dropped.
#[derive(Clone, Debug, Default)]
pub struct JsonParser {}

impl JsonParser {
    pub fn new() -> JsonParser {
        JsonParser {}
    }

    fn timestamp_from_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
        match value {
            serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .ok(),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i > NANOS_THRESHOLD {
                        Utc.timestamp_opt(i / 1_000_000_000, (i % 1_000_000_000) as u32)
                            .single()
                    } else {
                        Utc.timestamp_opt(i, 0).single()
                    }
                } else {
                    n.as_f64()
                        .and_then(|f| Utc.timestamp_opt(f as i64, 0).single())
                }
            }
            _ => None,
        }
    }
}

impl Parser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, raw: &[u8]) -> Result<LogEntry, ParserError> {
        let value: serde_json::Value = serde_json::from_str(utf8(raw)?)?;
        let object = value.as_object().ok_or(ParserError::NotAnObject)?;

        let mut entry = LogEntry::new(LogLevel::Info, "", "");

        if let Some(timestamp) = object.get("timestamp").and_then(Self::timestamp_from_value) {
            entry.timestamp = timestamp;
        }
        if let Some(level) = object.get("level").and_then(|v| v.as_str()) {
            if let Ok(level) = LogLevel::from_str(level) {
                entry.level = level;
            }
        }
        if let Some(message) = object.get("message").and_then(|v| v.as_str()) {
            entry.message = message.to_owned();
        }
        if let Some(logger) = object.get("logger").and_then(|v| v.as_str()) {
            entry.logger = logger.to_owned();
        }
        if let Some(fields) = object.get("fields").and_then(|v| v.as_object()) {
            for (key, value) in fields {
                entry
                    .fields
                    .insert(key.clone(), FieldValue::from(value.clone()));
            }
        }
        if let Some(labels) = object.get("labels").and_then(|v| v.as_object()) {
            for (key, value) in labels {
                if let Some(value) = value.as_str() {
                    entry.labels.insert(key.clone(), value.to_owned());
                }
            }
        }
        if let Some(trace_id) = object.get("trace_id").and_then(|v| v.as_str()) {
            entry.trace_id = Some(trace_id.to_owned());
        }
        if let Some(span_id) = object.get("span_id").and_then(|v| v.as_str()) {
            entry.span_id = Some(span_id.to_owned());
        }

        Ok(entry)
    }
}
