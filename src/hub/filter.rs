use crate::{
    alert::Severity,
    entry::LogLevel,
    hub::{MessageKind, StreamMessage},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A per-client subscription filter. Every absent constraint means
/// "unrestricted along that axis"; constraints are checked in a fixed
/// order and the first miss rejects the message.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClientFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_types: Option<Vec<MessageKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severities: Option<Vec<Severity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_levels: Option<Vec<LogLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_fields: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl ClientFilter {
    pub fn matches(&self, message: &StreamMessage) -> bool {
        if let Some(types) = &self.message_types {
            if !types.contains(&message.kind) {
                return false;
            }
        }

        if message.kind == MessageKind::TaskUpdate {
            if let Some(task_ids) = &self.task_ids {
                let task_id = message.data["task_id"].as_str().unwrap_or_default();
                if !task_ids.iter().any(|id| id == task_id) {
                    return false;
                }
            }
        }

        if message.kind == MessageKind::Alert {
            if let Some(severities) = &self.severities {
                let severity = message.data["severity"]
                    .as_str()
                    .and_then(|s| s.parse::<Severity>().ok());
                match severity {
                    Some(severity) if severities.contains(&severity) => {}
                    _ => return false,
                }
            }
        }

        if matches!(
            message.kind,
            MessageKind::SystemStatus | MessageKind::MetricsUpdate
        ) {
            if let Some(components) = &self.components {
                let component = message.data["component"].as_str().unwrap_or_default();
                if !components.iter().any(|c| c == component) {
                    return false;
                }
            }
        }

        if matches!(message.kind, MessageKind::LogEntry | MessageKind::LogStream) {
            if let Some(levels) = &self.log_levels {
                let level = message.data["level"]
                    .as_str()
                    .and_then(|s| s.parse::<LogLevel>().ok());
                match level {
                    Some(level) if levels.contains(&level) => {}
                    _ => return false,
                }
            }

            if let Some(sources) = &self.log_sources {
                let logger = message.data["logger"].as_str().unwrap_or_default();
                if !sources.iter().any(|source| source == logger) {
                    return false;
                }
            }

            if let Some(fields) = &self.log_fields {
                for (key, expected) in fields {
                    let actual = &message.data["fields"][key];
                    let matches = match actual {
                        serde_json::Value::String(s) => s == expected,
                        other => &other.to_string() == expected,
                    };
                    if !matches {
                        return false;
                    }
                }
            }

            if let Some(query) = &self.query {
                if !Self::contains_query(&message.data, query) {
                    return false;
                }
            }
        }

        true
    }

    /// Case-insensitive containment across message, logger and field
    /// values.
    fn contains_query(data: &serde_json::Value, query: &str) -> bool {
        let needle = query.to_lowercase();
        let mut haystacks: Vec<String> = Vec::new();
        if let Some(message) = data["message"].as_str() {
            haystacks.push(message.to_lowercase());
        }
        if let Some(logger) = data["logger"].as_str() {
            haystacks.push(logger.to_lowercase());
        }
        if let Some(fields) = data["fields"].as_object() {
            for value in fields.values() {
                match value {
                    serde_json::Value::String(s) => haystacks.push(s.to_lowercase()),
                    other => haystacks.push(other.to_string().to_lowercase()),
                }
            }
        }
        haystacks.iter().any(|haystack| haystack.contains(&needle))
    }
}
