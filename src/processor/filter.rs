use crate::{
    entry::{FieldValue, LogEntry, LogLevel},
    processor::Processor,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FilterConfig {
    /// Levels allowed through. Empty means all levels are accepted.
    #[serde(default)]
    pub levels: Vec<LogLevel>,
    /// Message patterns; an entry passes if any pattern matches. Absent
    /// means unrestricted.
    #[serde(default)]
    pub message_patterns: Vec<String>,
    /// Exact-match constraints on field values. Every configured field must
    /// be present and equal.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// Drops entries that miss the configured level set, match none of the
/// message patterns, or mismatch any field constraint.
#[derive(Debug)]
pub struct FilterProcessor {
    levels: Vec<LogLevel>,
    patterns: Vec<Regex>,
    fields: BTreeMap<String, FieldValue>,
}

impl FilterProcessor {
    pub fn new(config: FilterConfig) -> Result<FilterProcessor, regex::Error> {
        let patterns = config
            .message_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterProcessor {
            levels: config.levels,
            patterns,
            fields: config.fields,
        })
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        if !self.levels.is_empty() && !self.levels.contains(&entry.level) {
            return false;
        }
        if !self.patterns.is_empty()
            && !self
                .patterns
                .iter()
                .any(|pattern| pattern.is_match(&entry.message))
        {
            return false;
        }
        for (key, expected) in &self.fields {
            if entry.fields.get(key) != Some(expected) {
                return false;
            }
        }
        true
    }
}

impl Processor for FilterProcessor {
    fn kind(&self) -> &'static str {
        "filter"
    }

    fn process(&mut self, entry: LogEntry) -> Option<LogEntry> {
        if self.matches(&entry) {
            Some(entry)
        } else {
            None
        }
    }
}
