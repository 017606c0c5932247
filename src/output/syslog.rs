use crate::{
    entry::{LogEntry, LogLevel},
    output::{Output, OutputError},
};
use serde::Deserialize;
use std::net::UdpSocket;

#[derive(Clone, Debug, Deserialize)]
pub struct SyslogOutputSettings {
    /// Address of the syslog daemon.
    #[serde(default = "SyslogOutputSettings::default_address")]
    pub address: String,
    /// Syslog facility number (default 16, local0).
    #[serde(default = "SyslogOutputSettings::default_facility")]
    pub facility: u8,
    /// Tag attached to each datagram.
    #[serde(default = "SyslogOutputSettings::default_tag")]
    pub tag: String,
}

impl SyslogOutputSettings {
    fn default_address() -> String {
        "127.0.0.1:514".to_owned()
    }

    fn default_facility() -> u8 {
        16
    }

    fn default_tag() -> String {
        "watchtower".to_owned()
    }
}

impl Default for SyslogOutputSettings {
    fn default() -> Self {
        SyslogOutputSettings {
            address: Self::default_address(),
            facility: Self::default_facility(),
            tag: Self::default_tag(),
        }
    }
}

/// Emits RFC 3164 datagrams over UDP. UDP sends never block, which keeps
/// the write path within its latency contract even when the daemon is
/// unreachable.
#[derive(Debug)]
pub struct SyslogOutput {
    name: String,
    level: LogLevel,
    socket: UdpSocket,
    address: String,
    facility: u8,
    tag: String,
    hostname: String,
}

impl SyslogOutput {
    pub fn new(
        name: &str,
        level: LogLevel,
        settings: SyslogOutputSettings,
    ) -> Result<SyslogOutput, std::io::Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_owned());
        Ok(SyslogOutput {
            name: name.to_owned(),
            level,
            socket,
            address: settings.address,
            facility: settings.facility,
            tag: settings.tag,
            hostname,
        })
    }

    fn severity(level: LogLevel) -> u8 {
        match level {
            LogLevel::Error => 3,
            LogLevel::Warn => 4,
            LogLevel::Info => 6,
            LogLevel::Debug => 7,
        }
    }

    fn encode(&self, entry: &LogEntry) -> String {
        let pri = (self.facility as u16) * 8 + Self::severity(entry.level) as u16;
        format!(
            "<{}>{} {} {}: [{}] {}",
            pri,
            entry.timestamp.format("%b %e %H:%M:%S"),
            self.hostname,
            self.tag,
            entry.logger,
            entry.message
        )
    }
}

impl Output for SyslogOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn level_floor(&self) -> LogLevel {
        self.level
    }

    fn write(&mut self, entry: &LogEntry) -> Result<(), OutputError> {
        let datagram = self.encode(entry);
        self.socket
            .send_to(datagram.as_bytes(), &self.address)
            .map_err(|source| OutputError::Write {
                name: self.name.clone(),
                source,
            })?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        // Datagrams are not buffered.
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}
