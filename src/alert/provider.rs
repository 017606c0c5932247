use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::RwLock,
};

#[derive(Debug, thiserror::Error)]
#[error("metric {0} is unavailable")]
pub struct MetricUnavailable(pub String);

/// One observation of a metric.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Read-only access to current and historical metric values. The trait is
/// deliberately narrow so evaluations can run against an in-memory fake in
/// tests; values returned are snapshots and may be cached by the
/// implementation.
pub trait MetricProvider: Debug + Send + Sync {
    /// The current value of a metric, optionally averaged over a recent
    /// timeframe.
    fn metric_value(
        &self,
        name: &str,
        timeframe: Option<Duration>,
    ) -> Result<f64, MetricUnavailable>;

    /// Samples observed within the trailing duration, oldest first.
    fn metric_history(
        &self,
        name: &str,
        duration: Duration,
    ) -> Result<Vec<MetricSample>, MetricUnavailable>;
}

/// An in-memory metric store fed by the ingest API. Each metric keeps a
/// bounded ring of recent samples; this is working state for alerting, not
/// long-term storage.
#[derive(Debug)]
pub struct MemoryMetricStore {
    capacity: usize,
    series: RwLock<HashMap<String, VecDeque<MetricSample>>>,
}

impl MemoryMetricStore {
    pub fn new(capacity: usize) -> MemoryMetricStore {
        MemoryMetricStore {
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, name: &str, value: f64) {
        self.record_at(name, value, Utc::now());
    }

    pub fn record_at(&self, name: &str, value: f64, timestamp: DateTime<Utc>) {
        let mut series = self.series.write().unwrap();
        let ring = series.entry(name.to_owned()).or_insert_with(VecDeque::new);
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(MetricSample { timestamp, value });
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl MetricProvider for MemoryMetricStore {
    fn metric_value(
        &self,
        name: &str,
        timeframe: Option<Duration>,
    ) -> Result<f64, MetricUnavailable> {
        let series = self.series.read().unwrap();
        let ring = series
            .get(name)
            .filter(|ring| !ring.is_empty())
            .ok_or_else(|| MetricUnavailable(name.to_owned()))?;

        match timeframe {
            None => Ok(ring.back().unwrap().value),
            Some(window) => {
                let cutoff = Utc::now() - window;
                let recent: Vec<f64> = ring
                    .iter()
                    .filter(|sample| sample.timestamp >= cutoff)
                    .map(|sample| sample.value)
                    .collect();
                if recent.is_empty() {
                    return Err(MetricUnavailable(name.to_owned()));
                }
                Ok(recent.iter().sum::<f64>() / recent.len() as f64)
            }
        }
    }

    fn metric_history(
        &self,
        name: &str,
        duration: Duration,
    ) -> Result<Vec<MetricSample>, MetricUnavailable> {
        let series = self.series.read().unwrap();
        let ring = series
            .get(name)
            .ok_or_else(|| MetricUnavailable(name.to_owned()))?;
        let cutoff = Utc::now() - duration;
        Ok(ring
            .iter()
            .filter(|sample| sample.timestamp >= cutoff)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_value_wins() {
        let store = MemoryMetricStore::new(16);
        store.record("cpu", 10.0);
        store.record("cpu", 20.0);
        assert_eq!(store.metric_value("cpu", None).unwrap(), 20.0);
    }

    #[test]
    fn missing_metric_is_unavailable() {
        let store = MemoryMetricStore::new(16);
        assert!(store.metric_value("absent", None).is_err());
        assert!(store.metric_history("absent", Duration::minutes(5)).is_err());
    }

    #[test]
    fn history_respects_window() {
        let store = MemoryMetricStore::new(16);
        let now = Utc::now();
        store.record_at("cpu", 1.0, now - Duration::minutes(30));
        store.record_at("cpu", 2.0, now - Duration::minutes(3));
        store.record_at("cpu", 3.0, now - Duration::minutes(1));

        let history = store.metric_history("cpu", Duration::minutes(5)).unwrap();
        let values: Vec<f64> = history.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn ring_is_bounded() {
        let store = MemoryMetricStore::new(3);
        for i in 0..10 {
            store.record("cpu", i as f64);
        }
        let history = store
            .metric_history("cpu", Duration::minutes(5))
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().value, 9.0);
    }

    #[test]
    fn timeframe_averages_recent_samples() {
        let store = MemoryMetricStore::new(16);
        let now = Utc::now();
        store.record_at("mem", 10.0, now - Duration::hours(2));
        store.record_at("mem", 30.0, now - Duration::minutes(2));
        store.record_at("mem", 50.0, now - Duration::minutes(1));

        let averaged = store
            .metric_value("mem", Some(Duration::minutes(10)))
            .unwrap();
        assert_eq!(averaged, 40.0);
    }
}
