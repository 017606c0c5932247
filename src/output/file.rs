use crate::{
    config::CentralizedLoggingConfig,
    entry::{LogEntry, LogLevel},
    output::{EntryFormat, Output, OutputError},
};
use chrono::Utc;
use serde::Deserialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FileOutputSettings {
    /// Path of the live log file. Defaults to
    /// `{directory}/{base_filename}.log` from the top-level document.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
    #[serde(default)]
    pub max_files: Option<usize>,
    #[serde(default)]
    pub max_age_days: Option<i64>,
    #[serde(default)]
    pub compress: Option<bool>,
}

impl FileOutputSettings {
    /// Fills unset knobs from the document-level directory, filename and
    /// rotation policy.
    pub fn apply_defaults(&mut self, document: &CentralizedLoggingConfig) {
        if self.path.is_none() {
            self.path = Some(
                Path::new(&document.directory).join(format!("{}.log", document.base_filename)),
            );
        }
        self.max_size_mb.get_or_insert(document.rotation.max_size_mb);
        self.max_files.get_or_insert(document.rotation.max_files);
        self.max_age_days
            .get_or_insert(document.rotation.max_age_days);
        self.compress.get_or_insert(document.rotation.compress);
    }
}

/// A rotating file sink. Writes always go to the live file; when the size
/// threshold is crossed, the live file is renamed aside, a fresh one is
/// opened, and a background thread compresses the rotated file and prunes
/// backups past the count and age limits.
#[derive(Debug)]
pub struct FileOutput {
    name: String,
    level: LogLevel,
    format: EntryFormat,
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    max_age_days: i64,
    compress: bool,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl FileOutput {
    pub fn new(
        name: &str,
        level: LogLevel,
        format: EntryFormat,
        settings: FileOutputSettings,
    ) -> Result<FileOutput, std::io::Error> {
        let path = settings
            .path
            .unwrap_or_else(|| PathBuf::from("watchtower.log"));
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();

        Ok(FileOutput {
            name: name.to_owned(),
            level,
            format,
            path,
            max_bytes: settings.max_size_mb.unwrap_or(100) * 1024 * 1024,
            max_files: settings.max_files.unwrap_or(5),
            max_age_days: settings.max_age_days.unwrap_or(7),
            compress: settings.compress.unwrap_or(false),
            writer: Some(BufWriter::new(file)),
            bytes_written,
        })
    }

    fn io_error(&self, source: std::io::Error) -> OutputError {
        OutputError::Write {
            name: self.name.clone(),
            source,
        }
    }

    /// Moves the live file aside and reopens a fresh one. Compression and
    /// backup pruning happen off the write path.
    fn rotate(&mut self) -> Result<(), OutputError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| self.io_error(e))?;
        }

        let rotated = self
            .path
            .with_extension(format!("log.{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
        fs::rename(&self.path, &rotated).map_err(|source| OutputError::Rotation {
            name: self.name.clone(),
            source,
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| OutputError::Rotation {
                name: self.name.clone(),
                source,
            })?;
        self.writer = Some(BufWriter::new(file));
        self.bytes_written = 0;

        let compress = self.compress;
        let live_path = self.path.clone();
        let max_files = self.max_files;
        let max_age_days = self.max_age_days;
        std::thread::spawn(move || {
            if compress {
                if let Err(error) = compress_rotated(&rotated) {
                    log::warn!("failed to compress rotated log {:?}: {}", rotated, error);
                }
            }
            if let Err(error) = prune_backups(&live_path, max_files, max_age_days) {
                log::warn!("failed to prune log backups for {:?}: {}", live_path, error);
            }
        });

        Ok(())
    }
}

/// Gzips a rotated file in place, replacing it with a `.gz` sibling.
fn compress_rotated(path: &Path) -> Result<(), std::io::Error> {
    let mut source = File::open(path)?;
    let target_path = {
        let mut os = path.as_os_str().to_owned();
        os.push(".gz");
        PathBuf::from(os)
    };
    let target = File::create(&target_path)?;
    let mut encoder = flate2::write::GzEncoder::new(target, flate2::Compression::default());
    std::io::copy(&mut source, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)
}

/// Removes rotated siblings of `live_path` beyond the backup count or older
/// than the age limit. Backups sort by name, which embeds the rotation
/// timestamp.
fn prune_backups(
    live_path: &Path,
    max_files: usize,
    max_age_days: i64,
) -> Result<(), std::io::Error> {
    let directory = match live_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = match live_path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => format!("{}.log.", stem),
        None => return Ok(()),
    };

    let mut backups: Vec<PathBuf> = fs::read_dir(&directory)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path != live_path
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&stem))
                    .unwrap_or(false)
        })
        .collect();
    backups.sort();

    // Oldest first: drop by count, then by age.
    while backups.len() > max_files {
        let oldest = backups.remove(0);
        fs::remove_file(oldest)?;
    }

    let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
    for backup in backups {
        let modified = backup.metadata()?.modified()?;
        let modified: chrono::DateTime<Utc> = modified.into();
        if modified < cutoff {
            fs::remove_file(backup)?;
        }
    }
    Ok(())
}

impl Output for FileOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn level_floor(&self) -> LogLevel {
        self.level
    }

    fn write(&mut self, entry: &LogEntry) -> Result<(), OutputError> {
        if self.writer.is_none() {
            return Err(OutputError::Closed {
                name: self.name.clone(),
            });
        }

        let line = format!("{}\n", self.format.render(entry));
        if self.bytes_written + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }

        let name = self.name.clone();
        let writer = self.writer.as_mut().ok_or(OutputError::Closed {
            name: name.clone(),
        })?;
        writer
            .write_all(line.as_bytes())
            .map_err(|source| OutputError::Write { name, source })?;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        if let Some(writer) = self.writer.as_mut() {
            let name = self.name.clone();
            writer
                .flush()
                .map_err(|source| OutputError::Write { name, source })?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_output(dir: &Path, max_size_mb: u64) -> FileOutput {
        FileOutput::new(
            "file",
            LogLevel::Debug,
            EntryFormat::Json,
            FileOutputSettings {
                path: Some(dir.join("app.log")),
                max_size_mb: Some(max_size_mb),
                max_files: Some(2),
                max_age_days: Some(7),
                compress: Some(false),
            },
        )
        .unwrap()
    }

    #[test]
    fn writes_and_flushes() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let mut output = test_output(tempdir.path(), 100);

        output
            .write(&LogEntry::new(LogLevel::Info, "first", "app"))
            .unwrap();
        output.flush().unwrap();
        // Flush is idempotent.
        output.flush().unwrap();

        let contents = fs::read_to_string(tempdir.path().join("app.log")).unwrap();
        assert!(contents.contains("first"));
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn rotates_when_size_exceeded() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let mut output = test_output(tempdir.path(), 100);
        // Force a tiny threshold without a megabyte of test data.
        output.max_bytes = 256;

        let long_message = "x".repeat(200);
        for _ in 0..4 {
            output
                .write(&LogEntry::new(LogLevel::Info, &long_message, "app"))
                .unwrap();
        }
        output.close().unwrap();

        let rotated: Vec<_> = fs::read_dir(tempdir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("app.log."))
            .collect();
        assert!(!rotated.is_empty(), "expected at least one rotated file");

        // The live file was reopened and holds only the newest write.
        let live = fs::read_to_string(tempdir.path().join("app.log")).unwrap();
        assert_eq!(live.lines().count(), 1);
    }

    #[test]
    fn write_after_close_fails() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let mut output = test_output(tempdir.path(), 100);
        output.close().unwrap();
        assert!(matches!(
            output.write(&LogEntry::new(LogLevel::Info, "m", "app")),
            Err(OutputError::Closed { .. })
        ));
    }
}
