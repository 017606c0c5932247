use crate::entry::LogLevel;
use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{fmt, marker::PhantomData, str::FromStr};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid settings for {component} {name}: {source}")]
    Settings {
        component: &'static str,
        name: String,
        source: serde_json::Error,
    },
    #[error("invalid endpoint for shipper {shipper}: {source}")]
    Endpoint {
        shipper: String,
        source: url::ParseError,
    },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode configuration document: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A mapping from component name to component configuration that remembers
/// the order in which entries appeared in the document. The processor chain
/// is built in this order, so it must survive deserialization; a plain map
/// type would sort or scramble it.
#[derive(Clone, Debug)]
pub struct NamedConfigs<T>(pub Vec<(String, T)>);

impl<T> Default for NamedConfigs<T> {
    fn default() -> Self {
        NamedConfigs(Vec::new())
    }
}

impl<T> NamedConfigs<T> {
    pub fn iter(&self) -> impl Iterator<Item = &(String, T)> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedConfigs<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = NamedConfigs<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of name to component configuration")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                // MapAccess yields entries in document order.
                while let Some((name, config)) = access.next_entry::<String, T>()? {
                    entries.push((name, config));
                }
                Ok(NamedConfigs(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

impl<T: Serialize> Serialize for NamedConfigs<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, config) in &self.0 {
            map.serialize_entry(name, config)?;
        }
        map.end()
    }
}

fn default_true() -> bool {
    true
}

fn default_settings() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

fn default_directory() -> String {
    "logs".to_owned()
}

fn default_base_filename() -> String {
    "watchtower".to_owned()
}

fn default_format() -> String {
    "json".to_owned()
}

fn default_buffer_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    5
}

/// Rotation policy for file outputs.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RotationConfig {
    #[serde(default = "RotationConfig::default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "RotationConfig::default_max_files")]
    pub max_files: usize,
    #[serde(default = "RotationConfig::default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub local_time: bool,
}

impl RotationConfig {
    fn default_max_size_mb() -> u64 {
        100
    }

    fn default_max_files() -> usize {
        5
    }

    fn default_max_age_days() -> i64 {
        7
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            max_size_mb: Self::default_max_size_mb(),
            max_files: Self::default_max_files(),
            max_age_days: Self::default_max_age_days(),
            compress: false,
            local_time: false,
        }
    }
}

/// Configuration for one output sink. `settings` is decoded into the
/// sink-specific settings struct when the sink is constructed, so a typo in
/// a setting fails at startup rather than at first write.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,
}

/// Configuration for one processor in the chain.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProcessorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,
}

/// Configuration for one shipper.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ShipperConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,
}

/// Configuration for the search index.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IndexingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "IndexingConfig::default_kind", rename = "type")]
    pub kind: String,
    #[serde(default = "IndexingConfig::default_index_name")]
    pub index_name: String,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub mappings: serde_json::Value,
    #[serde(default)]
    pub retention: Option<String>,
    #[serde(default = "default_true")]
    pub search_api: bool,
}

impl IndexingConfig {
    fn default_kind() -> String {
        "memory".to_owned()
    }

    fn default_index_name() -> String {
        "logs".to_owned()
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        IndexingConfig {
            enabled: true,
            kind: Self::default_kind(),
            index_name: Self::default_index_name(),
            settings: serde_json::Value::Null,
            mappings: serde_json::Value::Null,
            retention: None,
            search_api: true,
        }
    }
}

/// Configuration for live streaming to WebSocket clients.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StreamingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Levels eligible for streaming. Empty means all levels.
    #[serde(default)]
    pub stream_levels: Vec<LogLevel>,
    /// Logger names eligible for streaming. Empty means all loggers.
    #[serde(default)]
    pub stream_sources: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            enabled: true,
            buffer_size: default_buffer_size(),
            stream_levels: Vec::new(),
            stream_sources: Vec::new(),
            rate_limit: None,
        }
    }
}

/// The hierarchical configuration document for the centralized logger,
/// matching the wire shape accepted and returned by the config API.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CentralizedLoggingConfig {
    #[serde(default = "default_level")]
    pub level: LogLevel,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_base_filename")]
    pub base_filename: String,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub outputs: NamedConfigs<OutputConfig>,
    #[serde(default)]
    pub processors: NamedConfigs<ProcessorConfig>,
    #[serde(default)]
    pub shippers: NamedConfigs<ShipperConfig>,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds between periodic output flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    #[serde(default)]
    pub async_mode: bool,
}

impl Default for CentralizedLoggingConfig {
    fn default() -> Self {
        CentralizedLoggingConfig {
            level: default_level(),
            format: default_format(),
            directory: default_directory(),
            base_filename: default_base_filename(),
            rotation: RotationConfig::default(),
            outputs: NamedConfigs::default(),
            processors: NamedConfigs::default(),
            shippers: NamedConfigs::default(),
            indexing: IndexingConfig::default(),
            streaming: StreamingConfig::default(),
            buffer_size: default_buffer_size(),
            flush_interval: default_flush_interval(),
            async_mode: false,
        }
    }
}

const OUTPUT_KINDS: &[&str] = &["file", "console", "syslog", "http"];
const PROCESSOR_KINDS: &[&str] = &["filter", "transform", "enrich", "sample", "parse"];
const SHIPPER_KINDS: &[&str] = &["elasticsearch", "loki", "fluentd", "http"];
const FORMATS: &[&str] = &["json", "console", "structured"];

impl CentralizedLoggingConfig {
    /// Reads and validates a configuration document from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<CentralizedLoggingConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: CentralizedLoggingConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the structural invariants of the document. Component settings
    /// are decoded (and thus further validated) when each component is
    /// constructed; both happen during startup so misconfiguration is
    /// fail-fast either way.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !FORMATS.contains(&self.format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown format {:?}, expected one of {:?}",
                self.format, FORMATS
            )));
        }
        if self.rotation.max_size_mb == 0 {
            return Err(ConfigError::Invalid(
                "rotation.max_size_mb must be at least 1".to_owned(),
            ));
        }
        if self.rotation.max_files == 0 {
            return Err(ConfigError::Invalid(
                "rotation.max_files must be at least 1".to_owned(),
            ));
        }
        if self.flush_interval == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval must be at least 1 second".to_owned(),
            ));
        }
        if self.streaming.enabled && self.streaming.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "streaming.buffer_size must be at least 1".to_owned(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_size must be at least 1".to_owned(),
            ));
        }

        for (name, output) in self.outputs.iter() {
            if !OUTPUT_KINDS.contains(&output.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "output {:?} has unknown type {:?}",
                    name, output.kind
                )));
            }
            if let Some(format) = &output.format {
                if !FORMATS.contains(&format.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "output {:?} has unknown format {:?}",
                        name, format
                    )));
                }
            }
        }

        for (name, processor) in self.processors.iter() {
            if !PROCESSOR_KINDS.contains(&processor.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "processor {:?} has unknown type {:?}",
                    name, processor.kind
                )));
            }
        }

        for (name, shipper) in self.shippers.iter() {
            if !SHIPPER_KINDS.contains(&shipper.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "shipper {:?} has unknown type {:?}",
                    name, shipper.kind
                )));
            }
            if shipper.enabled {
                Url::from_str(&shipper.endpoint).map_err(|source| ConfigError::Endpoint {
                    shipper: name.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_order_survives_deserialization() {
        let document = r#"{
            "processors": {
                "zulu": {"type": "filter"},
                "alpha": {"type": "enrich"},
                "mike": {"type": "sample"}
            }
        }"#;

        let config: CentralizedLoggingConfig = serde_json::from_str(document).unwrap();
        let names: Vec<&str> = config
            .processors
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn default_document_is_valid() {
        CentralizedLoggingConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_component_types() {
        let document = r#"{
            "outputs": {"weird": {"type": "carrier-pigeon"}}
        }"#;
        let config: CentralizedLoggingConfig = serde_json::from_str(document).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_shipper_endpoint() {
        let document = r#"{
            "shippers": {"es": {"type": "elasticsearch", "endpoint": "not a url"}}
        }"#;
        let config: CentralizedLoggingConfig = serde_json::from_str(document).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_shipper_skips_endpoint_validation() {
        let document = r#"{
            "shippers": {"es": {"type": "elasticsearch", "enabled": false}}
        }"#;
        let config: CentralizedLoggingConfig = serde_json::from_str(document).unwrap();
        config.validate().unwrap();
    }
}
