use crate::{
    alert::{AlertInstance, Severity},
    logging::event,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DigestConfig {
    #[serde(default = "DigestConfig::default_enabled")]
    pub enabled: bool,
    /// Alerts at or above this severity bypass the digest and send
    /// immediately.
    #[serde(default = "DigestConfig::default_immediate_severity")]
    pub immediate_severity: Severity,
    /// Buffer cap; when full the oldest buffered alert is dropped.
    #[serde(default = "DigestConfig::default_max_alerts")]
    pub max_alerts: usize,
    /// Seconds between digest sends.
    #[serde(default = "DigestConfig::default_interval_secs")]
    pub interval_secs: u64,
}

impl DigestConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_immediate_severity() -> Severity {
        Severity::Critical
    }

    fn default_max_alerts() -> usize {
        100
    }

    fn default_interval_secs() -> u64 {
        300
    }
}

impl Default for DigestConfig {
    fn default() -> Self {
        DigestConfig {
            enabled: Self::default_enabled(),
            immediate_severity: Self::default_immediate_severity(),
            max_alerts: Self::default_max_alerts(),
            interval_secs: Self::default_interval_secs(),
        }
    }
}

/// The coalesced summary built for each digest send.
#[derive(Clone, Debug, Serialize)]
pub struct DigestSummary {
    pub alerts: Vec<AlertInstance>,
    pub total_alerts: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub time_range: String,
    pub generated_at: DateTime<Utc>,
}

impl DigestSummary {
    fn build(alerts: Vec<AlertInstance>) -> DigestSummary {
        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for alert in &alerts {
            *by_severity.entry(alert.severity.to_string()).or_insert(0) += 1;
            *by_status.entry(alert.status.to_string()).or_insert(0) += 1;
        }

        let earliest = alerts.iter().map(|a| a.fired_at).min();
        let latest = alerts.iter().map(|a| a.fired_at).max();
        let time_range = match (earliest, latest) {
            (Some(earliest), Some(latest)) => {
                format!("{} to {}", earliest.to_rfc3339(), latest.to_rfc3339())
            }
            _ => String::new(),
        };

        DigestSummary {
            total_alerts: alerts.len(),
            by_severity,
            by_status,
            time_range,
            generated_at: Utc::now(),
            alerts,
        }
    }

    fn subject(&self) -> String {
        format!("Alert digest: {} alerts", self.total_alerts)
    }

    fn body(&self) -> String {
        let mut body = format!(
            "{} alerts between {}\n\nBy severity:\n",
            self.total_alerts, self.time_range
        );
        for (severity, count) in &self.by_severity {
            body.push_str(&format!("  {}: {}\n", severity, count));
        }
        body.push_str("\nAlerts:\n");
        for alert in &self.alerts {
            body.push_str(&format!(
                "  [{}] {} - {} ({})\n",
                alert.severity,
                alert.rule_name,
                alert.message,
                alert.fired_at.to_rfc3339()
            ));
        }
        body
    }
}

/// The outgoing e-mail contract. HTML templating and SMTP live outside
/// this crate; implementations receive either one urgent instance or a
/// preformatted digest.
pub trait EmailSender: Debug + Send + Sync {
    fn send_immediate(&self, instance: &AlertInstance) -> anyhow::Result<()>;

    fn send_digest(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct DigestState {
    buffer: Vec<AlertInstance>,
    last_sent: Option<DateTime<Utc>>,
}

/// Coalesces sub-immediate e-mail notifications into periodic summaries.
/// Severities at or above the configured threshold send right away;
/// everything else buffers until the interval ticker fires. The ticker
/// thread blocks on a shutdown channel with a timeout, so `stop` cancels
/// it promptly even mid-interval.
#[derive(Debug)]
pub struct DigestCollector {
    config: DigestConfig,
    sender: Box<dyn EmailSender>,
    state: Mutex<DigestState>,
    shutdown: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl DigestCollector {
    pub fn new(
        config: DigestConfig,
        sender: Box<dyn EmailSender>,
        parent_logger: &Logger,
    ) -> DigestCollector {
        DigestCollector {
            config,
            sender,
            state: Mutex::new(DigestState::default()),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
            logger: parent_logger.new(o!("component" => "digest")),
        }
    }

    /// Routes one alert: immediately through the sender when the digest is
    /// disabled or the severity clears the threshold, into the buffer
    /// otherwise.
    pub fn record(&self, instance: &AlertInstance) -> anyhow::Result<()> {
        if !self.config.enabled || instance.severity >= self.config.immediate_severity {
            return self.sender.send_immediate(instance);
        }

        let mut state = self.state.lock().unwrap();
        if state.buffer.len() == self.config.max_alerts {
            let dropped = state.buffer.remove(0);
            debug!(
                self.logger, "digest buffer full, dropped oldest alert";
                event::INSTANCE_ID => dropped.id,
            );
        }
        state.buffer.push(instance.clone());
        Ok(())
    }

    /// Builds and sends the digest for everything buffered. On success the
    /// buffer clears and `last_sent` updates; an empty buffer skips the
    /// cycle silently.
    pub fn flush(&self) -> anyhow::Result<()> {
        let summary = {
            let state = self.state.lock().unwrap();
            if state.buffer.is_empty() {
                return Ok(());
            }
            DigestSummary::build(state.buffer.clone())
        };

        self.sender
            .send_digest(&summary.subject(), &summary.body())?;

        let mut state = self.state.lock().unwrap();
        // Only the alerts that made it into this summary clear; anything
        // recorded during the send stays for the next cycle.
        let sent = summary.total_alerts.min(state.buffer.len());
        state.buffer.drain(..sent);
        state.last_sent = Some(summary.generated_at);
        info!(
            self.logger, "digest sent";
            "alerts" => summary.total_alerts,
        );
        Ok(())
    }

    /// Starts the interval ticker.
    pub fn start(this: &std::sync::Arc<DigestCollector>) {
        let mut worker = this.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let collector = std::sync::Arc::clone(this);
        let interval = Duration::from_secs(this.config.interval_secs.max(1));

        let handle = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(error) = collector.flush() {
                        warn!(
                            collector.logger, "digest send failed, buffer retained";
                            "error" => error.to_string(),
                        );
                    }
                }
            }
        });

        *this.shutdown.lock().unwrap() = Some(shutdown_tx);
        *worker = Some(handle);
    }

    /// Stops the ticker. Joins the thread, which wakes promptly from its
    /// timed wait.
    pub fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    pub fn buffered_count(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_sent
    }
}
