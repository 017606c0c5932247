use crate::{
    config::{CentralizedLoggingConfig, ConfigError},
    entry::{LogEntry, LogLevel},
    hub::{Hub, MessageKind, StreamMessage},
    index::{IndexStats, InvertedIndex, SearchQuery, SearchResult},
    logging::event,
    metrics::{ApiClientMetricsCollector, PipelineMetricsCollector, ShipperMetricsCollector},
    output::{build_output, Output},
    processor::{build_processor, Processor},
    ship::{build_shipper, Shipper, ShipperError, ShipperStatus},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use slog::{debug, o, warn, Logger};
use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{self, RecvTimeoutError, Sender, SyncSender, TrySendError},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// How often the background collector publishes pipeline statistics to the
/// hub.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Counter snapshot for the stats API.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineCounters {
    pub entries_total: u64,
    pub entries_by_level: BTreeMap<String, u64>,
    pub entries_dropped: u64,
    pub output_errors: BTreeMap<String, u64>,
    pub index_errors: u64,
}

/// The full snapshot served by the stats API and pushed to the hub by the
/// periodic collector.
#[derive(Clone, Debug, Serialize)]
pub struct LoggerStats {
    pub version: String,
    pub uptime_secs: i64,
    pub counters: PipelineCounters,
    pub outputs: Vec<OutputInfo>,
    pub shippers: Vec<ShipperStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexStats>,
    pub hub_clients: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct OutputInfo {
    pub name: String,
    pub level: LogLevel,
}

/// The glue binding parsers, processors, outputs, the index, the hub and
/// the shippers; owns their lifecycle. One instance exists per server and
/// is released in `shutdown`.
pub struct CentralizedLogger {
    config: RwLock<CentralizedLoggingConfig>,
    processors: Mutex<Vec<(String, Box<dyn Processor>)>>,
    outputs: Mutex<Vec<Box<dyn Output>>>,
    shippers: RwLock<Vec<Arc<Shipper>>>,
    index: Option<Arc<InvertedIndex>>,
    hub: Arc<Hub>,
    counters: Mutex<PipelineCounters>,
    metrics: Option<PipelineMetricsCollector>,
    api_metrics: ApiClientMetricsCollector,
    shipper_metrics: Option<ShipperMetricsCollector>,
    started_at: DateTime<Utc>,
    version: String,
    workers: Mutex<Vec<(Sender<()>, JoinHandle<()>)>>,
    ingest: Mutex<Option<SyncSender<LogEntry>>>,
    ingest_worker: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl CentralizedLogger {
    /// Builds the whole pipeline from a validated configuration document.
    /// Component construction decodes each settings object, so any
    /// misconfiguration surfaces here, before the first entry flows.
    pub fn new(
        config: CentralizedLoggingConfig,
        hub: Arc<Hub>,
        version: &str,
        api_metrics: &ApiClientMetricsCollector,
        parent_logger: &Logger,
    ) -> Result<CentralizedLogger, ConfigError> {
        config.validate()?;
        let logger = parent_logger.new(o!("component" => "centralized_logger"));

        let processors = Self::build_processors(&config)?;
        let outputs = Self::build_outputs(&config)?;
        let shippers = Self::build_shippers(&config, api_metrics, &logger)?;

        let index = if config.indexing.enabled {
            Some(Arc::new(InvertedIndex::new(&config.indexing.index_name)))
        } else {
            None
        };

        Ok(CentralizedLogger {
            config: RwLock::new(config),
            processors: Mutex::new(processors),
            outputs: Mutex::new(outputs),
            shippers: RwLock::new(shippers),
            index,
            hub,
            counters: Mutex::new(PipelineCounters::default()),
            metrics: None,
            api_metrics: api_metrics.clone(),
            shipper_metrics: None,
            started_at: Utc::now(),
            version: version.to_owned(),
            workers: Mutex::new(Vec::new()),
            ingest: Mutex::new(None),
            ingest_worker: Mutex::new(None),
            logger,
        })
    }

    fn build_processors(
        config: &CentralizedLoggingConfig,
    ) -> Result<Vec<(String, Box<dyn Processor>)>, ConfigError> {
        let mut processors = Vec::new();
        for (name, processor_config) in config.processors.iter() {
            if !processor_config.enabled {
                continue;
            }
            processors.push((name.clone(), build_processor(name, processor_config)?));
        }
        Ok(processors)
    }

    fn build_outputs(
        config: &CentralizedLoggingConfig,
    ) -> Result<Vec<Box<dyn Output>>, ConfigError> {
        let mut outputs = Vec::new();
        for (name, output_config) in config.outputs.iter() {
            if !output_config.enabled {
                continue;
            }
            outputs.push(build_output(name, output_config, config)?);
        }
        Ok(outputs)
    }

    fn build_shippers(
        config: &CentralizedLoggingConfig,
        api_metrics: &ApiClientMetricsCollector,
        logger: &Logger,
    ) -> Result<Vec<Arc<Shipper>>, ConfigError> {
        let mut shippers = Vec::new();
        for (name, shipper_config) in config.shippers.iter() {
            if !shipper_config.enabled {
                continue;
            }
            shippers.push(Arc::new(build_shipper(
                name,
                shipper_config,
                api_metrics,
                logger,
            )?));
        }
        Ok(shippers)
    }

    pub fn set_metrics_collectors(
        &mut self,
        pipeline: &PipelineMetricsCollector,
        shipper: &ShipperMetricsCollector,
    ) {
        self.metrics = Some(pipeline.clone());
        self.shipper_metrics = Some(shipper.clone());
        for entry in self.shippers.write().unwrap().iter_mut() {
            if let Some(shipper_mut) = Arc::get_mut(entry) {
                shipper_mut.set_metrics_collector(shipper);
            }
        }
    }

    /// Starts the shippers' tickers, the periodic output flusher, the
    /// statistics collector and, in async mode, the ingest worker.
    pub fn start(this: &Arc<CentralizedLogger>) {
        for shipper in this.shippers.read().unwrap().iter() {
            shipper.start();
        }

        let (async_mode, buffer_size) = {
            let config = this.config.read().unwrap();
            (config.async_mode, config.buffer_size.max(1))
        };
        if async_mode {
            let (sender, receiver) = mpsc::sync_channel(buffer_size);
            let worker_self = Arc::clone(this);
            let handle = std::thread::spawn(move || {
                // Runs until the sender is dropped at shutdown, draining
                // whatever is still queued.
                while let Ok(entry) = receiver.recv() {
                    worker_self.process(entry);
                }
            });
            *this.ingest.lock().unwrap() = Some(sender);
            *this.ingest_worker.lock().unwrap() = Some(handle);
        }

        let flush_interval =
            Duration::from_secs(this.config.read().unwrap().flush_interval.max(1));
        Self::spawn_worker(this, flush_interval, |logger_ref| {
            if let Err(error) = logger_ref.flush_outputs() {
                warn!(
                    logger_ref.logger, "periodic flush failed";
                    "error" => error.to_string(),
                );
            }
        });

        Self::spawn_worker(this, STATS_INTERVAL, |logger_ref| {
            let stats = logger_ref.stats();
            logger_ref.hub.broadcast(StreamMessage::new(
                MessageKind::MetricsUpdate,
                serde_json::json!(stats),
            ));
        });
    }

    fn spawn_worker<F>(this: &Arc<CentralizedLogger>, interval: Duration, work: F)
    where
        F: Fn(&CentralizedLogger) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let worker_self = Arc::clone(this);
        let handle = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => work(&worker_self),
            }
        });
        this.workers.lock().unwrap().push((shutdown_tx, handle));
    }

    /// Accepts one entry. In async mode the entry is queued for the ingest
    /// worker and a full queue drops it; otherwise the caller's thread runs
    /// the pipeline.
    pub fn log(&self, entry: LogEntry) {
        let queued = {
            let ingest = self.ingest.lock().unwrap();
            match &*ingest {
                Some(sender) => match sender.try_send(entry) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        self.counters.lock().unwrap().entries_dropped += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics
                                .entries_dropped
                                .with_label_values(&["buffer_full"])
                                .inc();
                        }
                        Ok(())
                    }
                    // The worker is gone; fall through to inline processing.
                    Err(TrySendError::Disconnected(entry)) => Err(entry),
                },
                None => Err(entry),
            }
        };
        match queued {
            Ok(()) => {}
            Err(entry) => self.process(entry),
        }
    }

    /// The hot path: one entry through the chain, then fan-out.
    fn process(&self, entry: LogEntry) {
        {
            let mut counters = self.counters.lock().unwrap();
            counters.entries_total += 1;
            *counters
                .entries_by_level
                .entry(entry.level.to_string())
                .or_insert(0) += 1;
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .entries_total
                .with_label_values(&[entry.level.as_str(), &entry.logger, "centralized"])
                .inc();
        }

        // Processor chain, strictly in configured order. A drop stops the
        // entry here and counts it exactly once.
        let mut current = entry;
        {
            let mut processors = self.processors.lock().unwrap();
            for (name, processor) in processors.iter_mut() {
                let started = Instant::now();
                let outcome = processor.process(current);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .processor_duration
                        .with_label_values(&[name])
                        .observe(started.elapsed().as_secs_f64());
                }
                match outcome {
                    Some(next) => current = next,
                    None => {
                        self.counters.lock().unwrap().entries_dropped += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics
                                .entries_dropped
                                .with_label_values(&["filtered"])
                                .inc();
                        }
                        debug!(
                            self.logger, "entry dropped by processor";
                            event::PROCESSOR => name.clone(),
                        );
                        return;
                    }
                }
            }
        }

        // Fan out to outputs; a write error is recorded and the fan-out
        // continues.
        {
            let mut outputs = self.outputs.lock().unwrap();
            for output in outputs.iter_mut() {
                if current.level < output.level_floor() {
                    continue;
                }
                if let Err(error) = output.write(&current) {
                    let name = output.name().to_owned();
                    *self
                        .counters
                        .lock()
                        .unwrap()
                        .output_errors
                        .entry(name.clone())
                        .or_insert(0) += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.output_errors.with_label_values(&[&name]).inc();
                    }
                    warn!(
                        self.logger, "output write failed";
                        event::OUTPUT => name,
                        "error" => error.to_string(),
                    );
                }
            }
        }

        // Index for search; the entry still reaches every other sink if
        // this fails.
        if let Some(index) = &self.index {
            if let Err(error) = index.index(&current) {
                self.counters.lock().unwrap().index_errors += 1;
                if let Some(metrics) = &self.metrics {
                    metrics
                        .index_errors
                        .with_label_values(&[index.name()])
                        .inc();
                }
                warn!(
                    self.logger, "failed to index entry";
                    "error" => error.to_string(),
                );
            }
        }

        // Live streaming, gated by the stream policy.
        if self.passes_stream_policy(&current) {
            self.hub.broadcast(StreamMessage::new(
                MessageKind::LogEntry,
                serde_json::json!(current),
            ));
        }

        // Shippers buffer only; an overflow is their problem to report.
        for shipper in self.shippers.read().unwrap().iter() {
            if let Err(error) = shipper.ship(std::slice::from_ref(&current)) {
                warn!(
                    self.logger, "shipper rejected entry";
                    event::SHIPPER => shipper.name().to_owned(),
                    "error" => error.to_string(),
                );
            }
        }
    }

    fn passes_stream_policy(&self, entry: &LogEntry) -> bool {
        let config = self.config.read().unwrap();
        if !config.streaming.enabled {
            return false;
        }
        let streaming = &config.streaming;
        if !streaming.stream_levels.is_empty() && !streaming.stream_levels.contains(&entry.level)
        {
            return false;
        }
        if !streaming.stream_sources.is_empty()
            && !streaming.stream_sources.contains(&entry.logger)
        {
            return false;
        }
        true
    }

    /// Flushes every output. Idempotent; also invoked by the periodic
    /// flusher. One lock per flush pass keeps the hot path from convoying
    /// behind slow sinks.
    pub fn flush_outputs(&self) -> Result<(), crate::output::OutputError> {
        let mut outputs = self.outputs.lock().unwrap();
        let mut first_error = None;
        for output in outputs.iter_mut() {
            if let Err(error) = output.flush() {
                warn!(
                    self.logger, "output flush failed";
                    event::OUTPUT => output.name().to_owned(),
                    "error" => error.to_string(),
                );
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Flushes one output by name. Returns false if no such output exists.
    pub fn flush_output(&self, name: &str) -> Result<bool, crate::output::OutputError> {
        let mut outputs = self.outputs.lock().unwrap();
        for output in outputs.iter_mut() {
            if output.name() == name {
                output.flush()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn outputs_info(&self) -> Vec<OutputInfo> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .map(|output| OutputInfo {
                name: output.name().to_owned(),
                level: output.level_floor(),
            })
            .collect()
    }

    pub fn shipper_statuses(&self) -> Vec<ShipperStatus> {
        self.shippers
            .read()
            .unwrap()
            .iter()
            .map(|shipper| shipper.status())
            .collect()
    }

    /// Sends a probe entry through the named shipper's destination.
    pub fn test_shipper(&self, name: &str) -> Option<Result<(), ShipperError>> {
        self.shippers
            .read()
            .unwrap()
            .iter()
            .find(|shipper| shipper.name() == name)
            .map(|shipper| shipper.test_connection())
    }

    pub fn search(&self, query: &SearchQuery) -> Option<Result<SearchResult, crate::index::IndexError>> {
        self.index.as_ref().map(|index| index.search(query))
    }

    pub fn index(&self) -> Option<&Arc<InvertedIndex>> {
        self.index.as_ref()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> CentralizedLoggingConfig {
        self.config.read().unwrap().clone()
    }

    /// Replaces the runtime configuration: validates the document, builds
    /// the new processors, outputs and shippers, then swaps them in. Old
    /// shippers drain before the swap returns. The index and the hub
    /// survive reconfiguration.
    pub fn apply_config(&self, new_config: CentralizedLoggingConfig) -> Result<(), ConfigError> {
        new_config.validate()?;

        let new_processors = Self::build_processors(&new_config)?;
        let mut new_outputs = Self::build_outputs(&new_config)?;
        let mut new_shippers = Self::build_shippers(&new_config, &self.api_metrics, &self.logger)?;
        if let Some(collector) = &self.shipper_metrics {
            for entry in new_shippers.iter_mut() {
                if let Some(shipper_mut) = Arc::get_mut(entry) {
                    shipper_mut.set_metrics_collector(collector);
                }
            }
        }
        for shipper in &new_shippers {
            shipper.start();
        }

        *self.processors.lock().unwrap() = new_processors;
        {
            let mut outputs = self.outputs.lock().unwrap();
            std::mem::swap(&mut *outputs, &mut new_outputs);
        }
        // new_outputs now holds the previous sinks.
        for output in new_outputs.iter_mut() {
            if let Err(error) = output.close() {
                warn!(
                    self.logger, "failed to close replaced output";
                    event::OUTPUT => output.name().to_owned(),
                    "error" => error.to_string(),
                );
            }
        }

        let old_shippers = {
            let mut shippers = self.shippers.write().unwrap();
            std::mem::replace(&mut *shippers, new_shippers)
        };
        for shipper in old_shippers {
            shipper.stop();
        }

        *self.config.write().unwrap() = new_config;
        Ok(())
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            version: self.version.clone(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            counters: self.counters.lock().unwrap().clone(),
            outputs: self.outputs_info(),
            shippers: self.shipper_statuses(),
            index: self.index.as_ref().map(|index| index.stats()),
            hub_clients: self.hub.client_count(),
        }
    }

    /// Ordered shutdown: drain the ingest queue, stop the background
    /// workers, flush and close the outputs, drain and stop the shippers,
    /// close the index.
    pub fn shutdown(&self) {
        // Dropping the sender ends the ingest worker's loop after it has
        // drained everything already queued.
        drop(self.ingest.lock().unwrap().take());
        if let Some(worker) = self.ingest_worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        let workers: Vec<(Sender<()>, JoinHandle<()>)> =
            self.workers.lock().unwrap().drain(..).collect();
        for (shutdown, _) in &workers {
            let _ = shutdown.send(());
        }
        for (_, handle) in workers {
            let _ = handle.join();
        }

        {
            let mut outputs = self.outputs.lock().unwrap();
            for output in outputs.iter_mut() {
                if let Err(error) = output.close() {
                    warn!(
                        self.logger, "failed to close output";
                        event::OUTPUT => output.name().to_owned(),
                        "error" => error.to_string(),
                    );
                }
            }
        }

        for shipper in self.shippers.read().unwrap().iter() {
            shipper.stop();
        }

        if let Some(index) = &self.index {
            index.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use serde_json::json;

    fn test_logger(metric: &str, document: serde_json::Value) -> Arc<CentralizedLogger> {
        let config: CentralizedLoggingConfig = serde_json::from_value(document).unwrap();
        let logger = setup_test_logging();
        let hub = Hub::new(16, "test", &logger);
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name(metric).unwrap();
        Arc::new(
            CentralizedLogger::new(config, hub, "test", &api_metrics, &logger).unwrap(),
        )
    }

    #[test]
    fn entries_flow_to_the_index() {
        let pipeline = test_logger("logger_index", json!({}));
        pipeline.log(LogEntry::new(LogLevel::Info, "payment received", "billing"));
        pipeline.log(LogEntry::new(LogLevel::Error, "db timeout", "storage"));

        let result = pipeline
            .search(&SearchQuery {
                query: "payment".to_owned(),
                ..SearchQuery::default()
            })
            .unwrap()
            .unwrap();
        assert_eq!(result.total, 1);

        let stats = pipeline.stats();
        assert_eq!(stats.counters.entries_total, 2);
        assert_eq!(stats.counters.entries_by_level.get("info"), Some(&1));
        assert_eq!(stats.counters.entries_by_level.get("error"), Some(&1));
    }

    #[test]
    fn chain_applies_in_config_order_and_drops_count_once() {
        let pipeline = test_logger(
            "logger_chain",
            json!({
                "processors": {
                    "keep_errors": {
                        "type": "filter",
                        "settings": {"levels": ["error"]}
                    },
                    "tag": {
                        "type": "transform",
                        "settings": {"add_fields": {"stage": "prod"}}
                    }
                }
            }),
        );

        pipeline.log(LogEntry::new(LogLevel::Info, "dropped", "app"));
        pipeline.log(LogEntry::new(LogLevel::Error, "kept", "app"));

        let stats = pipeline.stats();
        assert_eq!(stats.counters.entries_dropped, 1);

        // The surviving entry went through the transform too.
        let result = pipeline
            .search(&SearchQuery::default())
            .unwrap()
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(
            result.hits[0].entry.fields.get("stage"),
            Some(&crate::entry::FieldValue::String("prod".to_owned()))
        );
    }

    #[test]
    fn disabled_indexing_disables_search() {
        let pipeline = test_logger(
            "logger_noindex",
            json!({"indexing": {"enabled": false}}),
        );
        pipeline.log(LogEntry::new(LogLevel::Info, "m", "app"));
        assert!(pipeline.search(&SearchQuery::default()).is_none());
        assert!(pipeline.stats().index.is_none());
    }

    #[test]
    fn stream_policy_gates_levels_and_sources() {
        let pipeline = test_logger(
            "logger_policy",
            json!({
                "streaming": {
                    "enabled": true,
                    "stream_levels": ["error"],
                    "stream_sources": ["billing"]
                }
            }),
        );

        let passes = LogEntry::new(LogLevel::Error, "m", "billing");
        let wrong_level = LogEntry::new(LogLevel::Info, "m", "billing");
        let wrong_source = LogEntry::new(LogLevel::Error, "m", "auth");
        assert!(pipeline.passes_stream_policy(&passes));
        assert!(!pipeline.passes_stream_policy(&wrong_level));
        assert!(!pipeline.passes_stream_policy(&wrong_source));
    }

    #[test]
    fn apply_config_swaps_the_chain() {
        let pipeline = test_logger("logger_reconfig", json!({}));
        pipeline.log(LogEntry::new(LogLevel::Debug, "before", "app"));

        let stricter: CentralizedLoggingConfig = serde_json::from_value(json!({
            "processors": {
                "errors_only": {
                    "type": "filter",
                    "settings": {"levels": ["error"]}
                }
            }
        }))
        .unwrap();
        pipeline.apply_config(stricter).unwrap();

        pipeline.log(LogEntry::new(LogLevel::Debug, "after", "app"));
        assert_eq!(pipeline.stats().counters.entries_dropped, 1);
        assert_eq!(pipeline.config().processors.len(), 1);
    }

    #[test]
    fn async_mode_drains_on_shutdown() {
        let pipeline = test_logger(
            "logger_async",
            json!({"async_mode": true, "buffer_size": 64}),
        );
        CentralizedLogger::start(&pipeline);

        for i in 0..10 {
            pipeline.log(LogEntry::new(
                LogLevel::Info,
                &format!("queued {}", i),
                "app",
            ));
        }
        // Shutdown joins the ingest worker after it drains the queue.
        pipeline.shutdown();

        let stats = pipeline.stats();
        assert_eq!(stats.counters.entries_total, 10);
        assert_eq!(stats.index.unwrap().doc_count, 10);
    }

    #[test]
    fn shutdown_closes_the_index() {
        let pipeline = test_logger("logger_shutdown", json!({}));
        pipeline.log(LogEntry::new(LogLevel::Info, "m", "app"));
        pipeline.shutdown();
        assert!(matches!(
            pipeline.search(&SearchQuery::default()),
            Some(Err(_))
        ));
    }

    #[test]
    fn rejects_invalid_document() {
        let config: CentralizedLoggingConfig = serde_json::from_value(json!({
            "outputs": {"weird": {"type": "carrier-pigeon"}}
        }))
        .unwrap();
        let logger = setup_test_logging();
        let hub = Hub::new(16, "test", &logger);
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("logger_invalid").unwrap();
        assert!(CentralizedLogger::new(config, hub, "test", &api_metrics, &logger).is_err());
    }
}
