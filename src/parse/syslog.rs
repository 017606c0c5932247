use crate::{
    entry::{FieldValue, LogEntry, LogLevel},
    parse::{utf8, Parser, ParserError},
};
use chrono::{Datelike, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// RFC 3164 shape: `<PRI>TIMESTAMP HOST TAG: MESSAGE`. The tag may carry
    /// a `[pid]` suffix.
    static ref SYSLOG_LINE: Regex = Regex::new(
        r"^<(\d{1,3})>([A-Z][a-z]{2}\s+\d{1,2} \d{2}:\d{2}:\d{2}) (\S+) ([^:\[\s]+)(?:\[(\d+)\])?: (.*)$"
    )
    .unwrap();
}

/// Parses BSD syslog datagrams. The PRI decodes into facility and severity;
/// severity maps onto the pipeline's four levels (emerg through err become
/// error, warning becomes warn, notice and info become info, debug stays
/// debug).
#[derive(Clone, Debug, Default)]
pub struct SyslogParser {}

impl SyslogParser {
    pub fn new() -> SyslogParser {
        SyslogParser {}
    }

    fn level_from_severity(severity: u8) -> LogLevel {
        match severity {
            0..=3 => LogLevel::Error,
            4 => LogLevel::Warn,
            5 | 6 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

impl Parser for SyslogParser {
    fn name(&self) -> &'static str {
        "syslog"
    }

    fn parse(&self, raw: &[u8]) -> Result<LogEntry, ParserError> {
        let line = utf8(raw)?;
        let captures = SYSLOG_LINE
            .captures(line)
            .ok_or_else(|| ParserError::Malformed {
                format: "syslog",
                reason: "line does not match <PRI>TIMESTAMP HOST TAG: MESSAGE".to_owned(),
            })?;

        let pri: u16 = captures[1].parse().map_err(|_| ParserError::Malformed {
            format: "syslog",
            reason: "PRI is not a number".to_owned(),
        })?;
        if pri > 191 {
            return Err(ParserError::Malformed {
                format: "syslog",
                reason: format!("PRI {} out of range", pri),
            });
        }
        let facility = (pri / 8) as u8;
        let severity = (pri % 8) as u8;

        let host = &captures[3];
        let tag = &captures[4];
        let message = &captures[6];

        let mut entry = LogEntry::new(Self::level_from_severity(severity), message, tag);

        // The BSD timestamp has no year; assume the current one.
        let with_year = format!("{} {}", Utc::now().year(), captures[2].replace("  ", " "));
        if let Ok(naive) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S") {
            if let Some(timestamp) = Utc.from_local_datetime(&naive).single() {
                entry.timestamp = timestamp;
            }
        }

        entry
            .fields
            .insert("host".to_owned(), FieldValue::from(host));
        entry.fields.insert("tag".to_owned(), FieldValue::from(tag));
        entry
            .fields
            .insert("facility".to_owned(), FieldValue::Int(facility as i64));
        entry
            .fields
            .insert("severity".to_owned(), FieldValue::Int(severity as i64));
        if let Some(pid) = captures.get(5) {
            if let Ok(pid) = pid.as_str().parse::<i64>() {
                entry.fields.insert("pid".to_owned(), FieldValue::Int(pid));
            }
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3164_line() {
        let parser = SyslogParser::new();
        let entry = parser
            .parse(b"<34>Oct 11 22:14:15 mymachine su: 'su root' failed for lonvick on /dev/pts/8")
            .unwrap();

        // PRI 34 = facility 4 (auth), severity 2 (crit) -> error.
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.logger, "su");
        assert_eq!(
            entry.message,
            "'su root' failed for lonvick on /dev/pts/8"
        );
        assert_eq!(
            entry.fields.get("host"),
            Some(&FieldValue::String("mymachine".to_owned()))
        );
        assert_eq!(entry.fields.get("facility"), Some(&FieldValue::Int(4)));
        assert_eq!(entry.fields.get("severity"), Some(&FieldValue::Int(2)));
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(SyslogParser::level_from_severity(0), LogLevel::Error);
        assert_eq!(SyslogParser::level_from_severity(3), LogLevel::Error);
        assert_eq!(SyslogParser::level_from_severity(4), LogLevel::Warn);
        assert_eq!(SyslogParser::level_from_severity(5), LogLevel::Info);
        assert_eq!(SyslogParser::level_from_severity(6), LogLevel::Info);
        assert_eq!(SyslogParser::level_from_severity(7), LogLevel::Debug);
    }

    #[test]
    fn tag_with_pid() {
        let parser = SyslogParser::new();
        let entry = parser
            .parse(b"<13>Feb  5 17:32:18 web-1 nginx[4321]: upstream timed out")
            .unwrap();
        assert_eq!(entry.logger, "nginx");
        assert_eq!(entry.fields.get("pid"), Some(&FieldValue::Int(4321)));
        assert_eq!(entry.level, LogLevel::Info);
    }

    #[test]
    fn rejects_garbage() {
        let parser = SyslogParser::new();
        assert!(parser.parse(b"plainly not syslog").is_err());
        assert!(parser
            .parse(b"<999>Oct 11 22:14:15 h t: out of range pri")
            .is_err());
    }
}
