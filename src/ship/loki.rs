use crate::{
    entry::LogEntry,
    http::{Method, RequestParameters, RetryingAgent},
    metrics::ApiClientMetricsCollector,
    ship::{Destination, ShipperError},
};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use url::Url;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LokiSettings {
    /// Labels attached to every stream, merged with each entry's own level,
    /// logger and labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "LokiSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl LokiSettings {
    fn default_timeout_secs() -> u64 {
        10
    }
}

/// Ships batches to Loki's push API. Entries group into streams keyed by
/// their composite label set; within a stream, values are `[nanos, line]`
/// pairs where the line is the message followed by the JSON-rendered fields
/// when any are present.
#[derive(Clone, Debug)]
pub struct LokiShipper {
    endpoint: Url,
    settings: LokiSettings,
    agent: RetryingAgent,
}

impl LokiShipper {
    pub fn new(
        endpoint: Url,
        settings: LokiSettings,
        api_metrics: &ApiClientMetricsCollector,
    ) -> LokiShipper {
        LokiShipper {
            endpoint,
            settings,
            agent: RetryingAgent::new("loki", api_metrics),
        }
    }

    fn stream_labels(&self, entry: &LogEntry) -> BTreeMap<String, String> {
        let mut labels = self.settings.labels.clone();
        labels.insert("level".to_owned(), entry.level.to_string());
        labels.insert("logger".to_owned(), entry.logger.clone());
        for (key, value) in &entry.labels {
            labels.insert(key.clone(), value.clone());
        }
        labels
    }

    fn line(entry: &LogEntry) -> String {
        if entry.fields.is_empty() {
            entry.message.clone()
        } else {
            format!(
                "{} {}",
                entry.message,
                serde_json::to_string(&entry.fields).unwrap_or_default()
            )
        }
    }

    fn push_body(&self, batch: &[LogEntry]) -> serde_json::Value {
        // BTreeMap keys give the streams a stable order; Loki itself does
        // not care.
        let mut streams: BTreeMap<BTreeMap<String, String>, Vec<(String, String)>> =
            BTreeMap::new();
        for entry in batch {
            streams
                .entry(self.stream_labels(entry))
                .or_insert_with(Vec::new)
                .push((
                    entry.timestamp.timestamp_nanos().to_string(),
                    Self::line(entry),
                ));
        }

        serde_json::json!({
            "streams": streams
                .into_iter()
                .map(|(labels, values)| {
                    serde_json::json!({"stream": labels, "values": values})
                })
                .collect::<Vec<_>>()
        })
    }

    fn push_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().expect("endpoint cannot be a base");
            segments
                .pop_if_empty()
                .extend(&["loki", "api", "v1", "push"]);
        }
        url
    }
}

impl Destination for LokiShipper {
    fn kind(&self) -> &'static str {
        "loki"
    }

    fn deliver(&self, shipper: &str, batch: &[LogEntry]) -> Result<(), ShipperError> {
        let request = self.agent.prepare_request(&RequestParameters {
            url: self.push_url(),
            method: Method::Post,
            headers: Vec::new(),
            timeout: Some(Duration::from_secs(self.settings.timeout_secs)),
        });

        self.agent
            .send_json_once(&request, "push", &self.push_body(batch))
            .map(|_| ())
            .map_err(|source| ShipperError::Http {
                shipper: shipper.to_owned(),
                source: Box::new(source),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogLevel;
    use mockito::mock;

    fn shipper_with(metric: &str, labels: BTreeMap<String, String>, base: &str) -> LokiShipper {
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name(metric).unwrap();
        LokiShipper::new(
            Url::parse(base).unwrap(),
            LokiSettings {
                labels,
                timeout_secs: 2,
            },
            &api_metrics,
        )
    }

    #[test]
    fn groups_entries_by_label_set() {
        let mut configured = BTreeMap::new();
        configured.insert("job".to_owned(), "watchtower".to_owned());
        let shipper = shipper_with("loki_group", configured, "http://localhost:3100");

        let batch = vec![
            LogEntry::new(LogLevel::Info, "one", "app"),
            LogEntry::new(LogLevel::Info, "two", "app"),
            LogEntry::new(LogLevel::Error, "three", "app"),
        ];
        let body = shipper.push_body(&batch);
        let streams = body["streams"].as_array().unwrap();

        // Two label sets: {info, app} and {error, app}.
        assert_eq!(streams.len(), 2);
        let info_stream = streams
            .iter()
            .find(|s| s["stream"]["level"] == "info")
            .unwrap();
        assert_eq!(info_stream["values"].as_array().unwrap().len(), 2);
        assert_eq!(info_stream["stream"]["job"], "watchtower");
    }

    #[test]
    fn line_appends_fields_json() {
        let plain = LogEntry::new(LogLevel::Info, "bare", "app");
        assert_eq!(LokiShipper::line(&plain), "bare");

        let with_fields = LogEntry::new(LogLevel::Info, "rich", "app").with_field("k", "v");
        assert_eq!(LokiShipper::line(&with_fields), r#"rich {"k":"v"}"#);
    }

    #[test]
    fn delivers_to_push_endpoint() {
        let mocked = mock("POST", "/tenant/loki/api/v1/push").with_status(204).create();
        let shipper = shipper_with(
            "loki_deliver",
            BTreeMap::new(),
            &format!("{}/tenant", mockito::server_url()),
        );
        shipper
            .deliver("loki", &[LogEntry::new(LogLevel::Info, "m", "app")])
            .unwrap();
        mocked.assert();
    }
}
