use crate::{
    entry::{LogEntry, LogLevel},
    output::{EntryFormat, Output, OutputError},
};
use serde::Deserialize;
use std::io::Write;

#[derive(Clone, Debug, Deserialize)]
pub struct ConsoleOutputSettings {
    /// "stdout" or "stderr".
    #[serde(default = "ConsoleOutputSettings::default_stream")]
    pub stream: String,
}

impl ConsoleOutputSettings {
    fn default_stream() -> String {
        "stdout".to_owned()
    }
}

impl Default for ConsoleOutputSettings {
    fn default() -> Self {
        ConsoleOutputSettings {
            stream: Self::default_stream(),
        }
    }
}

/// Writes rendered entries to stdout or stderr.
#[derive(Debug)]
pub struct ConsoleOutput {
    name: String,
    level: LogLevel,
    format: EntryFormat,
    use_stderr: bool,
}

impl ConsoleOutput {
    pub fn new(
        name: &str,
        level: LogLevel,
        format: EntryFormat,
        settings: ConsoleOutputSettings,
    ) -> ConsoleOutput {
        ConsoleOutput {
            name: name.to_owned(),
            level,
            format,
            use_stderr: settings.stream == "stderr",
        }
    }
}

impl Output for ConsoleOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn level_floor(&self) -> LogLevel {
        self.level
    }

    fn write(&mut self, entry: &LogEntry) -> Result<(), OutputError> {
        let line = format!("{}\n", self.format.render(entry));
        let result = if self.use_stderr {
            std::io::stderr().lock().write_all(line.as_bytes())
        } else {
            std::io::stdout().lock().write_all(line.as_bytes())
        };
        result.map_err(|source| OutputError::Write {
            name: self.name.clone(),
            source,
        })
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        let result = if self.use_stderr {
            std::io::stderr().lock().flush()
        } else {
            std::io::stdout().lock().flush()
        };
        result.map_err(|source| OutputError::Write {
            name: self.name.clone(),
            source,
        })
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.flush()
    }
}
