use crate::{
    entry::{FieldValue, LogEntry, LogLevel},
    parse::{utf8, Parser, ParserError},
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// `host ident authuser [timestamp] "METHOD URI HTTP/x.y" status bytes`
    static ref CLF_LINE: Regex = Regex::new(
        r#"^(\S+) (\S+) (\S+) \[([^\]]+)\] "(\S+) (\S+) HTTP/([\d.]+)" (\d{3}) (\d+|-)"#
    )
    .unwrap();
}

/// Parses Common Log Format access lines. All extracted values land in
/// fields; the entry itself is informational with logger "access_log".
#[derive(Clone, Debug, Default)]
pub struct ClfParser {}

impl ClfParser {
    pub fn new() -> ClfParser {
        ClfParser {}
    }
}

impl Parser for ClfParser {
    fn name(&self) -> &'static str {
        "clf"
    }

    fn parse(&self, raw: &[u8]) -> Result<LogEntry, ParserError> {
        let line = utf8(raw)?;
        let captures = CLF_LINE
            .captures(line)
            .ok_or_else(|| ParserError::Malformed {
                format: "clf",
                reason: "line does not match the Common Log Format".to_owned(),
            })?;

        let mut entry = LogEntry::new(LogLevel::Info, line.trim_end(), "access_log");

        if let Ok(timestamp) = DateTime::parse_from_str(&captures[4], "%d/%b/%Y:%H:%M:%S %z") {
            entry.timestamp = timestamp.with_timezone(&Utc);
        }

        let status: i64 = captures[8].parse().map_err(|_| ParserError::Malformed {
            format: "clf",
            reason: "status is not a number".to_owned(),
        })?;
        let bytes: i64 = match &captures[9] {
            "-" => 0,
            value => value.parse().map_err(|_| ParserError::Malformed {
                format: "clf",
                reason: "bytes is not a number".to_owned(),
            })?,
        };

        entry
            .fields
            .insert("client_ip".to_owned(), FieldValue::from(&captures[1]));
        entry
            .fields
            .insert("auth".to_owned(), FieldValue::from(&captures[3]));
        entry
            .fields
            .insert("method".to_owned(), FieldValue::from(&captures[5]));
        entry
            .fields
            .insert("uri".to_owned(), FieldValue::from(&captures[6]));
        entry
            .fields
            .insert("http_version".to_owned(), FieldValue::from(&captures[7]));
        entry
            .fields
            .insert("status".to_owned(), FieldValue::Int(status));
        entry
            .fields
            .insert("bytes".to_owned(), FieldValue::Int(bytes));

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_access_line() {
        let parser = ClfParser::new();
        let entry = parser
            .parse(
                br#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /apache_pb.gif HTTP/1.0" 200 2326"#,
            )
            .unwrap();

        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.logger, "access_log");
        assert_eq!(
            entry.fields.get("client_ip"),
            Some(&FieldValue::String("127.0.0.1".to_owned()))
        );
        assert_eq!(
            entry.fields.get("method"),
            Some(&FieldValue::String("GET".to_owned()))
        );
        assert_eq!(entry.fields.get("status"), Some(&FieldValue::Int(200)));
        assert_eq!(entry.fields.get("bytes"), Some(&FieldValue::Int(2326)));
        // 13:55:36 -0700 is 20:55:36 UTC.
        assert_eq!(entry.timestamp.to_rfc3339(), "2000-10-10T20:55:36+00:00");
    }

    #[test]
    fn dash_bytes_means_zero() {
        let parser = ClfParser::new();
        let entry = parser
            .parse(br#"10.0.0.5 - - [05/Feb/2024:17:32:18 +0000] "HEAD /health HTTP/1.1" 204 -"#)
            .unwrap();
        assert_eq!(entry.fields.get("bytes"), Some(&FieldValue::Int(0)));
        assert_eq!(entry.fields.get("status"), Some(&FieldValue::Int(204)));
    }

    #[test]
    fn rejects_non_clf() {
        let parser = ClfParser::new();
        assert!(parser.parse(b"{\"message\": \"json\"}").is_err());
    }
}
