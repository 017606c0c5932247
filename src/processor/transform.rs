use crate::{
    entry::{FieldValue, LogEntry},
    processor::Processor,
};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TransformConfig {
    /// Field renames, source key to destination key.
    #[serde(default)]
    pub rename_fields: BTreeMap<String, String>,
    /// Optional message template. Supports `{{.Message}}`, `{{.Level}}`,
    /// `{{.Logger}}`, `{{.Timestamp}}` and `{{.Fields.X}}` placeholders.
    #[serde(default)]
    pub message_template: Option<String>,
    #[serde(default)]
    pub add_fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub remove_fields: Vec<String>,
}

/// Applies renames, a message template, added fields and removed fields to
/// a copy of the entry. The input is never mutated in place.
#[derive(Debug)]
pub struct TransformProcessor {
    config: TransformConfig,
}

impl TransformProcessor {
    pub fn new(config: TransformConfig) -> TransformProcessor {
        TransformProcessor { config }
    }

    fn render_template(template: &str, entry: &LogEntry) -> String {
        let mut rendered = template
            .replace("{{.Message}}", &entry.message)
            .replace("{{.Level}}", entry.level.as_str())
            .replace("{{.Logger}}", &entry.logger)
            .replace("{{.Timestamp}}", &entry.timestamp.to_rfc3339());

        // Substitute {{.Fields.X}} one field at a time; unresolved
        // references render as empty strings. The substitution budget
        // bounds templates whose field values themselves contain
        // placeholder syntax.
        let mut budget = 16;
        while let Some(start) = rendered.find("{{.Fields.") {
            budget -= 1;
            if budget == 0 {
                break;
            }
            let rest = &rendered[start + "{{.Fields.".len()..];
            let end = match rest.find("}}") {
                Some(end) => end,
                None => break,
            };
            let key = rest[..end].to_owned();
            let value = entry
                .fields
                .get(&key)
                .map(|v| v.to_string())
                .unwrap_or_default();
            let placeholder = format!("{{{{.Fields.{}}}}}", key);
            rendered = rendered.replace(&placeholder, &value);
        }
        rendered
    }
}

impl Processor for TransformProcessor {
    fn kind(&self) -> &'static str {
        "transform"
    }

    fn process(&mut self, entry: LogEntry) -> Option<LogEntry> {
        let mut transformed = entry.clone();

        for (source, destination) in &self.config.rename_fields {
            if let Some(value) = transformed.fields.remove(source) {
                transformed.fields.insert(destination.clone(), value);
            }
        }

        if let Some(template) = &self.config.message_template {
            // Render against the pre-transform entry so placeholders see
            // the original message.
            transformed.message = Self::render_template(template, &entry);
        }

        for (key, value) in &self.config.add_fields {
            transformed.fields.insert(key.clone(), value.clone());
        }

        for key in &self.config.remove_fields {
            transformed.fields.remove(key);
        }

        Some(transformed)
    }
}
