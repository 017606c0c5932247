mod console;
mod file;
mod http;
mod syslog;

use crate::{
    config::{CentralizedLoggingConfig, ConfigError, OutputConfig},
    entry::{LogEntry, LogLevel},
    ErrorClassification,
};
use std::{fmt::Debug, str::FromStr};

pub use console::{ConsoleOutput, ConsoleOutputSettings};
pub use file::{FileOutput, FileOutputSettings};
pub use http::{HttpOutput, HttpOutputSettings};
pub use syslog::{SyslogOutput, SyslogOutputSettings};

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("output {name}: write failed: {source}")]
    Write {
        name: String,
        source: std::io::Error,
    },
    #[error("output {name}: rotation failed: {source}")]
    Rotation {
        name: String,
        source: std::io::Error,
    },
    #[error("output {name}: HTTP delivery failed: {source}")]
    Http {
        name: String,
        source: Box<ureq::Error>,
    },
    #[error("output {name} is closed")]
    Closed { name: String },
}

impl ErrorClassification for OutputError {
    fn is_retryable(&self) -> bool {
        match self {
            // I/O and network failures may clear up on their own.
            OutputError::Write { .. } | OutputError::Rotation { .. } | OutputError::Http { .. } => {
                true
            }
            OutputError::Closed { .. } => false,
        }
    }
}

/// How an output renders entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryFormat {
    Json,
    Console,
    Structured,
}

impl FromStr for EntryFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "json" => Ok(EntryFormat::Json),
            "console" => Ok(EntryFormat::Console),
            "structured" => Ok(EntryFormat::Structured),
            other => Err(ConfigError::Invalid(format!("unknown format {:?}", other))),
        }
    }
}

impl EntryFormat {
    /// Renders one entry, without a trailing newline.
    pub fn render(&self, entry: &LogEntry) -> String {
        match self {
            EntryFormat::Json => {
                serde_json::to_string(entry).unwrap_or_else(|_| entry.message.clone())
            }
            EntryFormat::Console => {
                let mut line = format!(
                    "{} [{}] {}: {}",
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str().to_uppercase(),
                    entry.logger,
                    entry.message
                );
                for (key, value) in &entry.fields {
                    line.push_str(&format!(" {}={}", key, value));
                }
                line
            }
            EntryFormat::Structured => {
                let mut line = format!(
                    "ts={} level={} logger={} msg={:?}",
                    entry.timestamp.to_rfc3339(),
                    entry.level,
                    entry.logger,
                    entry.message
                );
                for (key, value) in &entry.labels {
                    line.push_str(&format!(" {}={}", key, value));
                }
                for (key, value) in &entry.fields {
                    line.push_str(&format!(" {}={}", key, value));
                }
                line
            }
        }
    }
}

/// A synchronous sink local to the process. Writes must not block
/// indefinitely; network-backed outputs carry their own timeouts. `flush`
/// is idempotent and safe to call from the periodic flusher while writes
/// happen on another thread.
pub trait Output: Debug + Send {
    fn name(&self) -> &str;

    /// Entries below this level are skipped by the pipeline.
    fn level_floor(&self) -> LogLevel;

    fn write(&mut self, entry: &LogEntry) -> Result<(), OutputError>;

    fn flush(&mut self) -> Result<(), OutputError>;

    fn close(&mut self) -> Result<(), OutputError>;
}

/// Constructs an output sink from its configuration document entry.
pub fn build_output(
    name: &str,
    config: &OutputConfig,
    document: &CentralizedLoggingConfig,
) -> Result<Box<dyn Output>, ConfigError> {
    let settings_error = |source| ConfigError::Settings {
        component: "output",
        name: name.to_owned(),
        source,
    };

    let format = match &config.format {
        Some(format) => EntryFormat::from_str(format)?,
        None => EntryFormat::from_str(&document.format)?,
    };
    let level = config.level.unwrap_or(document.level);

    match config.kind.as_str() {
        "file" => {
            let mut settings: FileOutputSettings =
                serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            settings.apply_defaults(document);
            let output = FileOutput::new(name, level, format, settings).map_err(|e| {
                ConfigError::Invalid(format!("output {:?}: {}", name, e))
            })?;
            Ok(Box::new(output))
        }
        "console" => {
            let settings = serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            Ok(Box::new(ConsoleOutput::new(name, level, format, settings)))
        }
        "syslog" => {
            let settings: SyslogOutputSettings =
                serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            let output = SyslogOutput::new(name, level, settings).map_err(|e| {
                ConfigError::Invalid(format!("output {:?}: {}", name, e))
            })?;
            Ok(Box::new(output))
        }
        "http" => {
            let settings: HttpOutputSettings =
                serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            let output = HttpOutput::new(name, level, settings).map_err(|e| {
                ConfigError::Invalid(format!("output {:?}: {}", name, e))
            })?;
            Ok(Box::new(output))
        }
        other => Err(ConfigError::Invalid(format!(
            "output {:?} has unknown type {:?}",
            name, other
        ))),
    }
}
