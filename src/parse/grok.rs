use crate::{
    entry::{FieldValue, LogEntry, LogLevel},
    parse::{utf8, Parser, ParserError},
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

lazy_static! {
    /// `%{PATTERN}` or `%{PATTERN:field}` references inside a grok pattern.
    static ref GROK_REFERENCE: Regex =
        Regex::new(r"%\{(?P<pattern>[A-Z0-9_]+)(?::(?P<field>[A-Za-z0-9_]+))?\}").unwrap();
}

/// The built-in pattern vocabulary. Enough to cover the patterns that appear
/// in practice; unknown names fall back to a non-greedy wildcard.
fn builtin_pattern(name: &str) -> &'static str {
    match name {
        "IP" => r"(?:\d{1,3}\.){3}\d{1,3}",
        "NUMBER" => r"-?\d+(?:\.\d+)?",
        "INT" => r"-?\d+",
        "WORD" => r"\w+",
        "NOTSPACE" => r"\S+",
        "HOSTNAME" => r"[A-Za-z0-9._-]+",
        "LOGLEVEL" => r"(?i:trace|debug|info|notice|warn(?:ing)?|error|fatal|critical)",
        "TIMESTAMP_ISO8601" => r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        "GREEDYDATA" => r".*",
        _ => r".+?",
    }
}

/// A grok parser configured with a map of named patterns. Patterns are
/// attempted in name order; the first match wins and its named captures
/// become string-valued fields on the entry.
#[derive(Debug)]
pub struct GrokParser {
    patterns: Vec<(String, Regex)>,
}

impl GrokParser {
    pub fn new(patterns: &BTreeMap<String, String>) -> Result<GrokParser, ParserError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for (name, pattern) in patterns {
            let expanded = Self::expand(pattern);
            let regex = Regex::new(&expanded).map_err(|source| ParserError::BadPattern {
                name: name.clone(),
                source,
            })?;
            compiled.push((name.clone(), regex));
        }
        Ok(GrokParser { patterns: compiled })
    }

    /// Rewrites `%{NAME:field}` references into named capture groups and
    /// `%{NAME}` references into plain groups.
    fn expand(pattern: &str) -> String {
        let mut expanded = String::with_capacity(pattern.len() * 2);
        let mut last = 0;
        for captures in GROK_REFERENCE.captures_iter(pattern) {
            let whole = captures.get(0).unwrap();
            expanded.push_str(&regex::escape(&pattern[last..whole.start()]));
            let body = builtin_pattern(&captures["pattern"]);
            match captures.name("field") {
                Some(field) => {
                    expanded.push_str(&format!("(?P<{}>{})", field.as_str(), body));
                }
                None => {
                    expanded.push_str(&format!("(?:{})", body));
                }
            }
            last = whole.end();
        }
        expanded.push_str(&regex::escape(&pattern[last..]));
        expanded
    }
}

impl Parser for GrokParser {
    fn name(&self) -> &'static str {
        "grok"
    }

    fn parse(&self, raw: &[u8]) -> Result<LogEntry, ParserError> {
        let line = utf8(raw)?;
        for (pattern_name, regex) in &self.patterns {
            if let Some(captures) = regex.captures(line) {
                let mut entry = LogEntry::new(LogLevel::Info, line.trim_end(), "grok");
                entry.fields.insert(
                    "grok_pattern".to_owned(),
                    FieldValue::from(pattern_name.as_str()),
                );
                for capture_name in regex.capture_names().flatten() {
                    if let Some(value) = captures.name(capture_name) {
                        entry
                            .fields
                            .insert(capture_name.to_owned(), FieldValue::from(value.as_str()));
                    }
                }
                return Ok(entry);
            }
        }
        Err(ParserError::NoPatternMatched)
    }
}
