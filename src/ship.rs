mod elasticsearch;
mod fluentd;
mod http;
mod loki;

use crate::{
    config::{ConfigError, ShipperConfig},
    entry::LogEntry,
    logging::event,
    metrics::{ApiClientMetricsCollector, ShipperMetricsCollector},
    ErrorClassification,
};
use chrono::{DateTime, Utc};
use dyn_clone::{clone_trait_object, DynClone};
use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};
use std::{
    fmt::Debug,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

pub use elasticsearch::{ElasticsearchSettings, ElasticsearchShipper};
pub use fluentd::{FluentdSettings, FluentdShipper};
pub use http::{HttpShipperSettings, HttpShipper};
pub use loki::{LokiSettings, LokiShipper};

#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("shipper {shipper}: delivery failed: {source}")]
    Http {
        shipper: String,
        source: Box<ureq::Error>,
    },
    #[error("shipper {shipper}: buffer overflowed its ceiling, dropped {dropped} entries")]
    BufferOverflow { shipper: String, dropped: usize },
    #[error("shipper {shipper} is stopped")]
    Stopped { shipper: String },
}

impl ErrorClassification for ShipperError {
    fn is_retryable(&self) -> bool {
        match self {
            // The next flush tick naturally retries delivery failures.
            ShipperError::Http { .. } => true,
            ShipperError::BufferOverflow { .. } | ShipperError::Stopped { .. } => false,
        }
    }
}

/// The destination half of a shipper: knows how to frame a batch for one
/// external system and deliver it in a single request. 2xx is success;
/// anything else comes back unchanged as a `ShipperError`.
pub trait Destination: Debug + DynClone + Send + Sync {
    fn kind(&self) -> &'static str;

    fn deliver(&self, shipper: &str, batch: &[LogEntry]) -> Result<(), ShipperError>;
}

clone_trait_object!(Destination);

/// Buffering and cadence knobs shared by every shipper kind. These decode
/// from the same settings object as the destination-specific knobs.
#[derive(Clone, Debug, Deserialize)]
pub struct ShipperTuning {
    /// Buffer length that triggers an immediate flush.
    #[serde(default = "ShipperTuning::default_high_water")]
    pub high_water: usize,
    /// Absolute buffer bound. Appends past it drop the oldest entries and
    /// surface an error to the caller.
    #[serde(default = "ShipperTuning::default_hard_ceiling")]
    pub hard_ceiling: usize,
    /// Seconds between periodic flushes of a non-empty buffer.
    #[serde(default = "ShipperTuning::default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl ShipperTuning {
    fn default_high_water() -> usize {
        100
    }

    fn default_hard_ceiling() -> usize {
        1000
    }

    fn default_flush_interval_secs() -> u64 {
        5
    }
}

impl Default for ShipperTuning {
    fn default() -> Self {
        ShipperTuning {
            high_water: Self::default_high_water(),
            hard_ceiling: Self::default_hard_ceiling(),
            flush_interval_secs: Self::default_flush_interval_secs(),
        }
    }
}

/// A point-in-time summary of one shipper, for the shippers API.
#[derive(Clone, Debug, Serialize)]
pub struct ShipperStatus {
    pub name: String,
    pub kind: &'static str,
    pub buffered_entries: usize,
    pub shipped_entries: u64,
    pub failed_batches: u64,
    pub dropped_entries: u64,
    pub last_flush: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct ShipperState {
    buffer: Vec<LogEntry>,
    shipped_entries: u64,
    failed_batches: u64,
    dropped_entries: u64,
    last_flush: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// An asynchronous forwarder to one external system. Entries accumulate in
/// a bounded in-memory buffer; a per-shipper ticker flushes on an interval,
/// crossing the high-water mark flushes immediately, and `stop` halts the
/// ticker and drains whatever remains.
#[derive(Debug)]
pub struct Shipper {
    name: String,
    destination: Box<dyn Destination>,
    tuning: ShipperTuning,
    state: Arc<Mutex<ShipperState>>,
    shutdown: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<ShipperMetricsCollector>,
    logger: Logger,
}

impl Shipper {
    pub fn new(
        name: &str,
        destination: Box<dyn Destination>,
        tuning: ShipperTuning,
        parent_logger: &Logger,
    ) -> Shipper {
        let logger = parent_logger.new(o!(event::SHIPPER => name.to_owned()));
        Shipper {
            name: name.to_owned(),
            destination,
            tuning,
            state: Arc::new(Mutex::new(ShipperState::default())),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
            metrics: None,
            logger,
        }
    }

    /// Provide a collector in which metrics about this shipper will be
    /// recorded.
    pub fn set_metrics_collector(&mut self, collector: &ShipperMetricsCollector) {
        self.metrics = Some(collector.clone());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.destination.kind()
    }

    /// Appends a batch to the buffer. Crossing the high-water mark triggers
    /// an immediate flush whose failure is not the caller's problem; the
    /// only error callers see is the buffer blowing through its ceiling.
    pub fn ship(&self, batch: &[LogEntry]) -> Result<(), ShipperError> {
        let overflowed;
        {
            let mut state = self.state.lock().unwrap();
            state.buffer.extend_from_slice(batch);

            if state.buffer.len() > self.tuning.hard_ceiling {
                let dropped = state.buffer.len() - self.tuning.hard_ceiling;
                state.buffer.drain(..dropped);
                state.dropped_entries += dropped as u64;
                if let Some(metrics) = &self.metrics {
                    metrics
                        .entries_dropped
                        .with_label_values(&[&self.name])
                        .inc_by(dropped as u64);
                }
                overflowed = Some(dropped);
            } else {
                overflowed = None;
            }

            if let Some(metrics) = &self.metrics {
                metrics
                    .buffered_entries
                    .with_label_values(&[&self.name])
                    .set(state.buffer.len() as i64);
            }
        }

        if let Some(dropped) = overflowed {
            warn!(
                self.logger, "buffer ceiling hit, oldest entries dropped";
                event::BATCH_SIZE => dropped,
            );
            return Err(ShipperError::BufferOverflow {
                shipper: self.name.clone(),
                dropped,
            });
        }

        let should_flush = {
            let state = self.state.lock().unwrap();
            state.buffer.len() >= self.tuning.high_water
        };
        if should_flush {
            if let Err(error) = self.flush() {
                warn!(
                    self.logger, "high-water flush failed, buffer retained";
                    "error" => error.to_string(),
                );
            }
        }
        Ok(())
    }

    /// Delivers the buffered entries. On success the buffer is cleared; on
    /// failure it is retained for the next attempt. Network I/O happens
    /// under the shipper's own lock so at most one flush is in flight.
    pub fn flush(&self) -> Result<(), ShipperError> {
        flush_buffer(&self.name, &*self.destination, &self.state, &self.metrics)
    }

    /// Sends one synthetic entry through the destination, for the shipper
    /// test API.
    pub fn test_connection(&self) -> Result<(), ShipperError> {
        let probe = LogEntry::new(
            crate::entry::LogLevel::Info,
            "shipper connectivity test",
            "watchtower",
        );
        self.destination.deliver(&self.name, &[probe])
    }

    /// Starts the periodic flush ticker.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx): (Sender<()>, Receiver<()>) = mpsc::channel();
        let interval = Duration::from_secs(self.tuning.flush_interval_secs);

        // The ticker gets its own destination clone and a second handle on
        // the shared state; flushing from the ticker and from ship() is
        // serialized by the state lock.
        let name = self.name.clone();
        let destination = self.destination.clone();
        let state = Arc::clone(&self.state);
        let metrics = self.metrics.clone();
        let logger = self.logger.clone();

        let handle = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(error) = flush_buffer(&name, &*destination, &state, &metrics) {
                        warn!(
                            logger, "periodic flush failed, buffer retained";
                            "error" => error.to_string(),
                        );
                    }
                }
            }
        });

        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        *worker = Some(handle);
    }

    /// Halts the ticker and performs one final flush. Entries that still
    /// cannot be delivered are dropped and logged.
    pub fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            // An error here means the worker already exited.
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        if let Err(error) = self.flush() {
            let mut state = self.state.lock().unwrap();
            let abandoned = state.buffer.len();
            state.buffer.clear();
            state.dropped_entries += abandoned as u64;
            if let Some(metrics) = &self.metrics {
                metrics
                    .entries_dropped
                    .with_label_values(&[&self.name])
                    .inc_by(abandoned as u64);
                metrics
                    .buffered_entries
                    .with_label_values(&[&self.name])
                    .set(0);
            }
            warn!(
                self.logger, "final drain failed, entries dropped";
                "error" => error.to_string(),
                event::BATCH_SIZE => abandoned,
            );
        } else {
            info!(self.logger, "shipper drained and stopped");
        }
    }

    pub fn status(&self) -> ShipperStatus {
        let state = self.state.lock().unwrap();
        ShipperStatus {
            name: self.name.clone(),
            kind: self.destination.kind(),
            buffered_entries: state.buffer.len(),
            shipped_entries: state.shipped_entries,
            failed_batches: state.failed_batches,
            dropped_entries: state.dropped_entries,
            last_flush: state.last_flush,
            last_error: state.last_error.clone(),
        }
    }
}

/// Delivers whatever is buffered, clearing the buffer on success and
/// retaining it on failure. Shared by the caller-facing flush and the
/// ticker thread.
fn flush_buffer(
    name: &str,
    destination: &dyn Destination,
    state: &Mutex<ShipperState>,
    metrics: &Option<ShipperMetricsCollector>,
) -> Result<(), ShipperError> {
    let mut state = state.lock().unwrap();
    if state.buffer.is_empty() {
        return Ok(());
    }

    match destination.deliver(name, &state.buffer) {
        Ok(()) => {
            let delivered = state.buffer.len();
            state.buffer.clear();
            state.shipped_entries += delivered as u64;
            state.last_flush = Some(Utc::now());
            state.last_error = None;
            if let Some(metrics) = metrics {
                metrics
                    .batches_shipped
                    .with_label_values(&[name, "success"])
                    .inc();
                metrics
                    .entries_shipped
                    .with_label_values(&[name])
                    .inc_by(delivered as u64);
                metrics.buffered_entries.with_label_values(&[name]).set(0);
            }
            Ok(())
        }
        Err(error) => {
            state.failed_batches += 1;
            state.last_error = Some(error.to_string());
            if let Some(metrics) = metrics {
                metrics
                    .batches_shipped
                    .with_label_values(&[name, "failure"])
                    .inc();
            }
            Err(error)
        }
    }
}

/// Constructs a shipper from its configuration document entry.
pub fn build_shipper(
    name: &str,
    config: &ShipperConfig,
    api_metrics: &ApiClientMetricsCollector,
    parent_logger: &Logger,
) -> Result<Shipper, ConfigError> {
    let settings_error = |source| ConfigError::Settings {
        component: "shipper",
        name: name.to_owned(),
        source,
    };
    let endpoint =
        url::Url::parse(&config.endpoint).map_err(|source| ConfigError::Endpoint {
            shipper: name.to_owned(),
            source,
        })?;
    let tuning: ShipperTuning =
        serde_json::from_value(config.settings.clone()).map_err(settings_error)?;

    let destination: Box<dyn Destination> = match config.kind.as_str() {
        "elasticsearch" => {
            let settings: ElasticsearchSettings =
                serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            Box::new(ElasticsearchShipper::new(endpoint, settings, api_metrics))
        }
        "loki" => {
            let settings: LokiSettings =
                serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            Box::new(LokiShipper::new(endpoint, settings, api_metrics))
        }
        "fluentd" => {
            let settings: FluentdSettings =
                serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            Box::new(FluentdShipper::new(endpoint, settings, api_metrics))
        }
        "http" => {
            let settings: HttpShipperSettings =
                serde_json::from_value(config.settings.clone()).map_err(settings_error)?;
            Box::new(HttpShipper::new(endpoint, settings, api_metrics))
        }
        other => {
            return Err(ConfigError::Invalid(format!(
                "shipper {:?} has unknown type {:?}",
                name, other
            )))
        }
    };

    Ok(Shipper::new(name, destination, tuning, parent_logger))
}
