use crate::{
    entry::{FieldValue, LogEntry},
    processor::Processor,
};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize)]
pub struct EnrichConfig {
    /// Static fields attached verbatim.
    #[serde(default)]
    pub static_fields: BTreeMap<String, FieldValue>,
    /// Attach the machine hostname as `hostname`.
    #[serde(default = "EnrichConfig::default_true")]
    pub hostname: bool,
    /// Attach pid/ppid/uid/gid of this process.
    #[serde(default = "EnrichConfig::default_true")]
    pub process_info: bool,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl EnrichConfig {
    fn default_true() -> bool {
        true
    }
}

impl Default for EnrichConfig {
    fn default() -> Self {
        EnrichConfig {
            static_fields: BTreeMap::new(),
            hostname: true,
            process_info: true,
            environment: None,
            service: None,
            version: None,
        }
    }
}

/// Attaches static and derived fields to every entry. The derived values
/// are captured once at construction; applying the processor twice yields
/// the same fields as applying it once.
#[derive(Debug)]
pub struct EnrichProcessor {
    derived: BTreeMap<String, FieldValue>,
}

impl EnrichProcessor {
    pub fn new(config: EnrichConfig) -> EnrichProcessor {
        let mut derived = config.static_fields;

        if config.hostname {
            if let Ok(name) = hostname::get() {
                derived.insert(
                    "hostname".to_owned(),
                    FieldValue::String(name.to_string_lossy().into_owned()),
                );
            }
        }
        if config.process_info {
            derived.insert(
                "pid".to_owned(),
                FieldValue::Int(std::process::id() as i64),
            );
            // Safety: these libc calls read process identity and cannot fail.
            derived.insert(
                "ppid".to_owned(),
                FieldValue::Int(unsafe { libc::getppid() } as i64),
            );
            derived.insert(
                "uid".to_owned(),
                FieldValue::Int(unsafe { libc::getuid() } as i64),
            );
            derived.insert(
                "gid".to_owned(),
                FieldValue::Int(unsafe { libc::getgid() } as i64),
            );
        }
        if let Some(environment) = config.environment {
            derived.insert("environment".to_owned(), FieldValue::String(environment));
        }
        if let Some(service) = config.service {
            derived.insert("service".to_owned(), FieldValue::String(service));
        }
        if let Some(version) = config.version {
            derived.insert("version".to_owned(), FieldValue::String(version));
        }

        EnrichProcessor { derived }
    }
}

impl Processor for EnrichProcessor {
    fn kind(&self) -> &'static str {
        "enrich"
    }

    fn process(&mut self, entry: LogEntry) -> Option<LogEntry> {
        let mut enriched = entry;
        for (key, value) in &self.derived {
            enriched.fields.insert(key.clone(), value.clone());
        }
        Some(enriched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogLevel;

    #[test]
    fn attaches_static_and_derived_fields() {
        let mut static_fields = BTreeMap::new();
        static_fields.insert("dc".to_owned(), FieldValue::from("eu-west"));
        let mut processor = EnrichProcessor::new(EnrichConfig {
            static_fields,
            environment: Some("test".to_owned()),
            service: Some("api".to_owned()),
            ..EnrichConfig::default()
        });

        let enriched = processor
            .process(LogEntry::new(LogLevel::Info, "m", "app"))
            .unwrap();
        assert_eq!(
            enriched.fields.get("dc"),
            Some(&FieldValue::String("eu-west".to_owned()))
        );
        assert_eq!(
            enriched.fields.get("environment"),
            Some(&FieldValue::String("test".to_owned()))
        );
        assert_eq!(
            enriched.fields.get("pid"),
            Some(&FieldValue::Int(std::process::id() as i64))
        );
        assert!(enriched.fields.contains_key("hostname"));
    }

    #[test]
    fn idempotent_on_repeated_application() {
        let mut processor = EnrichProcessor::new(EnrichConfig::default());
        let once = processor
            .process(LogEntry::new(LogLevel::Info, "m", "app"))
            .unwrap();
        let twice = processor.process(once.clone()).unwrap();
        assert_eq!(once.fields, twice.fields);
    }
}
