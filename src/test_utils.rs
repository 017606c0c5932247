//! Shared fakes and factories for unit and integration tests.

use crate::alert::{
    digest::EmailSender,
    provider::{MetricProvider, MetricSample, MetricUnavailable},
    action::Notifier,
    AlertInstance, AlertStatus, Severity,
};
use crate::entry::{LogEntry, LogLevel};
use chrono::{Duration, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

/// A metric provider backed by fixed values and histories.
#[derive(Clone, Debug, Default)]
pub struct StaticMetricProvider {
    values: HashMap<String, f64>,
    histories: HashMap<String, Vec<f64>>,
}

impl StaticMetricProvider {
    pub fn new(values: &[(&str, f64)]) -> StaticMetricProvider {
        StaticMetricProvider {
            values: values
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            histories: HashMap::new(),
        }
    }

    /// A provider whose history for `name` is the given values, spaced one
    /// second apart and ending now. The current value is the last sample.
    pub fn with_history(name: &str, values: &[f64]) -> StaticMetricProvider {
        let mut provider = StaticMetricProvider::default();
        if let Some(last) = values.last() {
            provider.values.insert(name.to_owned(), *last);
        }
        provider.histories.insert(name.to_owned(), values.to_vec());
        provider
    }
}

impl MetricProvider for StaticMetricProvider {
    fn metric_value(
        &self,
        name: &str,
        _timeframe: Option<Duration>,
    ) -> Result<f64, MetricUnavailable> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| MetricUnavailable(name.to_owned()))
    }

    fn metric_history(
        &self,
        name: &str,
        _duration: Duration,
    ) -> Result<Vec<MetricSample>, MetricUnavailable> {
        let values = self
            .histories
            .get(name)
            .ok_or_else(|| MetricUnavailable(name.to_owned()))?;
        let now = Utc::now();
        Ok(values
            .iter()
            .enumerate()
            .map(|(i, value)| MetricSample {
                timestamp: now - Duration::seconds((values.len() - i) as i64),
                value: *value,
            })
            .collect())
    }
}

/// A notifier that records every instance it is asked to deliver.
#[derive(Clone, Debug)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<AlertInstance>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn new() -> RecordingNotifier {
        RecordingNotifier {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn sent(&self) -> Vec<AlertInstance> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for RecordingNotifier {
    fn send_alert(&self, instance: &AlertInstance) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("notifier configured to fail");
        }
        self.sent.lock().unwrap().push(instance.clone());
        Ok(())
    }
}

/// An e-mail sender that records immediate sends and digests.
#[derive(Clone, Debug)]
pub struct RecordingEmailSender {
    immediate: Arc<Mutex<Vec<AlertInstance>>>,
    digests: Arc<Mutex<Vec<(String, String)>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingEmailSender {
    pub fn new() -> RecordingEmailSender {
        RecordingEmailSender {
            immediate: Arc::new(Mutex::new(Vec::new())),
            digests: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn immediate_count(&self) -> usize {
        self.immediate.lock().unwrap().len()
    }

    pub fn digests(&self) -> Vec<(String, String)> {
        self.digests.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

impl Default for RecordingEmailSender {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailSender for RecordingEmailSender {
    fn send_immediate(&self, instance: &AlertInstance) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("email sender configured to fail");
        }
        self.immediate.lock().unwrap().push(instance.clone());
        Ok(())
    }

    fn send_digest(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("email sender configured to fail");
        }
        self.digests
            .lock()
            .unwrap()
            .push((subject.to_owned(), body.to_owned()));
        Ok(())
    }
}

/// A firing instance with the given severity.
pub fn sample_instance(severity: Severity) -> AlertInstance {
    AlertInstance {
        id: Uuid::new_v4().to_string(),
        rule_id: "rule-1".to_owned(),
        rule_name: "sample rule".to_owned(),
        severity,
        status: AlertStatus::Firing,
        message: "sample alert".to_owned(),
        labels: Default::default(),
        annotations: Default::default(),
        fired_at: Utc::now(),
        resolved_at: None,
    }
}

/// A plain informational entry.
pub fn sample_entry(message: &str) -> LogEntry {
    LogEntry::new(LogLevel::Info, message, "test")
}
