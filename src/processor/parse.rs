use crate::{
    entry::{FieldValue, LogEntry},
    parse::{ClfParser, GrokParser, JsonParser, Parser, ParserError, SyslogParser},
    processor::Processor,
};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize)]
pub struct ParseProcessorConfig {
    /// Parsers to attempt, in order. Recognized names: json, syslog, clf,
    /// grok.
    #[serde(default = "ParseProcessorConfig::default_parsers")]
    pub parsers: Vec<String>,
    /// Pattern map for the grok parser, when enabled.
    #[serde(default)]
    pub grok_patterns: BTreeMap<String, String>,
}

impl ParseProcessorConfig {
    fn default_parsers() -> Vec<String> {
        vec!["json".to_owned()]
    }
}

/// Re-parses each entry's message through the configured parsers, stopping
/// at the first success. When every parser fails, the entry passes through
/// unchanged except for a `parse_error` field describing the last failure.
#[derive(Debug)]
pub struct ParseProcessor {
    parsers: Vec<Box<dyn Parser>>,
}

impl ParseProcessor {
    pub fn new(config: ParseProcessorConfig) -> Result<ParseProcessor, ParserError> {
        let mut parsers: Vec<Box<dyn Parser>> = Vec::with_capacity(config.parsers.len());
        for name in &config.parsers {
            match name.as_str() {
                "json" => parsers.push(Box::new(JsonParser::new())),
                "syslog" => parsers.push(Box::new(SyslogParser::new())),
                "clf" => parsers.push(Box::new(ClfParser::new())),
                "grok" => parsers.push(Box::new(GrokParser::new(&config.grok_patterns)?)),
                other => {
                    return Err(ParserError::Malformed {
                        format: "parse processor",
                        reason: format!("unknown parser {:?}", other),
                    })
                }
            }
        }
        Ok(ParseProcessor { parsers })
    }

    /// Carries pipeline context from the unparsed entry onto the parsed one:
    /// labels merge (parsed values win), trace ids survive, and an empty
    /// parsed logger falls back to the original.
    fn merge(original: &LogEntry, mut parsed: LogEntry) -> LogEntry {
        for (key, value) in &original.labels {
            parsed
                .labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if parsed.logger.is_empty() {
            parsed.logger = original.logger.clone();
        }
        if parsed.trace_id.is_none() {
            parsed.trace_id = original.trace_id.clone();
        }
        if parsed.span_id.is_none() {
            parsed.span_id = original.span_id.clone();
        }
        parsed
    }
}

impl Processor for ParseProcessor {
    fn kind(&self) -> &'static str {
        "parse"
    }

    fn process(&mut self, entry: LogEntry) -> Option<LogEntry> {
        let raw = entry.message.as_bytes().to_vec();
        let mut last_error: Option<ParserError> = None;
        for parser in &self.parsers {
            match parser.parse(&raw) {
                Ok(parsed) => return Some(Self::merge(&entry, parsed)),
                Err(error) => last_error = Some(error),
            }
        }

        let mut unparsed = entry;
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no parsers configured".to_owned());
        unparsed
            .fields
            .insert("parse_error".to_owned(), FieldValue::String(reason));
        Some(unparsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogLevel;
    use serde_json::json;

    fn parse_processor(settings: serde_json::Value) -> ParseProcessor {
        ParseProcessor::new(serde_json::from_value(settings).unwrap()).unwrap()
    }

    #[test]
    fn first_successful_parser_wins() {
        let mut processor = parse_processor(json!({"parsers": ["json", "syslog"]}));
        let entry = LogEntry::new(
            LogLevel::Info,
            r#"{"level": "error", "message": "decoded", "logger": "inner"}"#,
            "raw",
        );
        let parsed = processor.process(entry).unwrap();
        assert_eq!(parsed.level, LogLevel::Error);
        assert_eq!(parsed.message, "decoded");
        assert_eq!(parsed.logger, "inner");
    }

    #[test]
    fn fallthrough_to_second_parser() {
        let mut processor = parse_processor(json!({"parsers": ["json", "clf"]}));
        let entry = LogEntry::new(
            LogLevel::Info,
            r#"10.0.0.5 - - [05/Feb/2024:17:32:18 +0000] "GET / HTTP/1.1" 200 512"#,
            "raw",
        );
        let parsed = processor.process(entry).unwrap();
        assert_eq!(parsed.logger, "access_log");
        assert_eq!(parsed.fields.get("status"), Some(&FieldValue::Int(200)));
    }

    #[test]
    fn all_fail_sets_parse_error() {
        let mut processor = parse_processor(json!({"parsers": ["json", "syslog"]}));
        let entry = LogEntry::new(LogLevel::Warn, "free-form text", "raw");
        let unparsed = processor.process(entry).unwrap();
        assert_eq!(unparsed.message, "free-form text");
        assert_eq!(unparsed.level, LogLevel::Warn);
        assert!(unparsed.fields.contains_key("parse_error"));
    }

    #[test]
    fn labels_survive_parsing() {
        let mut processor = parse_processor(json!({"parsers": ["json"]}));
        let entry = LogEntry::new(LogLevel::Info, r#"{"message": "inner"}"#, "raw")
            .with_label("region", "eu");
        let parsed = processor.process(entry).unwrap();
        assert_eq!(parsed.labels.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn unknown_parser_name_fails_construction() {
        let result = ParseProcessor::new(ParseProcessorConfig {
            parsers: vec!["xml".to_owned()],
            grok_patterns: BTreeMap::new(),
        });
        assert!(result.is_err());
    }
}
