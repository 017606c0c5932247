mod enrich;
mod filter;
mod parse;
mod sample;
mod transform;

use crate::config::{ConfigError, ProcessorConfig};
use crate::entry::LogEntry;
use std::fmt::Debug;

pub use enrich::{EnrichConfig, EnrichProcessor};
pub use filter::{FilterConfig, FilterProcessor};
pub use parse::{ParseProcessorConfig, ParseProcessor};
pub use sample::{SampleConfig, SampleProcessor};
pub use transform::{TransformConfig, TransformProcessor};

/// A single transformation stage in the pipeline. A processor receives an
/// owned entry and either passes one on (possibly a modified copy) or drops
/// it by returning `None`. Processors never share mutable state across
/// entries; the sample processor's RNG is private to it.
pub trait Processor: Debug + Send {
    /// The processor kind, used as the metrics label for per-processor
    /// durations.
    fn kind(&self) -> &'static str;

    fn process(&mut self, entry: LogEntry) -> Option<LogEntry>;
}

/// Constructs a processor from its configuration document entry. Settings
/// are decoded here so a bad document fails at startup.
pub fn build_processor(
    name: &str,
    config: &ProcessorConfig,
) -> Result<Box<dyn Processor>, ConfigError> {
    let settings = |source| ConfigError::Settings {
        component: "processor",
        name: name.to_owned(),
        source,
    };

    match config.kind.as_str() {
        "filter" => {
            let decoded: FilterConfig =
                serde_json::from_value(config.settings.clone()).map_err(settings)?;
            let processor = FilterProcessor::new(decoded).map_err(|e| ConfigError::Invalid(
                format!("processor {:?}: {}", name, e),
            ))?;
            Ok(Box::new(processor))
        }
        "transform" => {
            let decoded: TransformConfig =
                serde_json::from_value(config.settings.clone()).map_err(settings)?;
            Ok(Box::new(TransformProcessor::new(decoded)))
        }
        "enrich" => {
            let decoded: EnrichConfig =
                serde_json::from_value(config.settings.clone()).map_err(settings)?;
            Ok(Box::new(EnrichProcessor::new(decoded)))
        }
        "sample" => {
            let decoded: SampleConfig =
                serde_json::from_value(config.settings.clone()).map_err(settings)?;
            Ok(Box::new(SampleProcessor::new(decoded)))
        }
        "parse" => {
            let decoded: ParseProcessorConfig =
                serde_json::from_value(config.settings.clone()).map_err(settings)?;
            let processor = ParseProcessor::new(decoded).map_err(|e| ConfigError::Invalid(
                format!("processor {:?}: {}", name, e),
            ))?;
            Ok(Box::new(processor))
        }
        other => Err(ConfigError::Invalid(format!(
            "processor {:?} has unknown type {:?}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_each_kind() {
        for (kind, settings) in [
            ("filter", json!({"levels": ["error"]})),
            ("transform", json!({"add_fields": {"env": "test"}})),
            ("enrich", json!({})),
            ("sample", json!({"rate": 0.5})),
            ("parse", json!({"parsers": ["json"]})),
        ] {
            let config = ProcessorConfig {
                kind: kind.to_owned(),
                enabled: true,
                settings,
            };
            let processor = build_processor("p", &config).unwrap();
            assert_eq!(processor.kind(), kind);
        }
    }

    #[test]
    fn rejects_malformed_settings() {
        let config = ProcessorConfig {
            kind: "sample".to_owned(),
            enabled: true,
            settings: json!({"rate": "not a number"}),
        };
        assert!(build_processor("p", &config).is_err());
    }
}
