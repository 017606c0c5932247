mod clf;
mod grok;
mod json;
mod syslog;

use crate::entry::LogEntry;
use std::fmt::Debug;

pub use clf::ClfParser;
pub use grok::GrokParser;
pub use json::JsonParser;
pub use syslog::SyslogParser;

/// Errors produced while turning raw bytes into a log entry. Parse failures
/// never abort the pipeline: the parse processor records them as a
/// `parse_error` field on the entry instead.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("input is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("malformed {format} input: {reason}")]
    Malformed {
        format: &'static str,
        reason: String,
    },
    #[error("input is not a JSON object")]
    NotAnObject,
    #[error("JSON syntax error: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("no grok pattern matched")]
    NoPatternMatched,
    #[error("grok pattern {name} does not compile: {source}")]
    BadPattern {
        name: String,
        source: regex::Error,
    },
}

/// A parser accepts raw bytes and produces a log entry. Implementations are
/// stateless after construction so a single parser can serve every entry
/// that flows through a parse processor.
pub trait Parser: Debug + Send {
    fn name(&self) -> &'static str;

    fn parse(&self, raw: &[u8]) -> Result<LogEntry, ParserError>;
}

pub(crate) fn utf8(raw: &[u8]) -> Result<&str, ParserError> {
    Ok(std::str::from_utf8(raw)?)
}
