use crate::{
    entry::LogEntry,
    http::{Method, RequestParameters, RetryingAgent},
    metrics::ApiClientMetricsCollector,
    ship::{Destination, ShipperError},
};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct FluentdSettings {
    #[serde(default = "FluentdSettings::default_tag")]
    pub tag: String,
    #[serde(default = "FluentdSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl FluentdSettings {
    fn default_tag() -> String {
        "watchtower".to_owned()
    }

    fn default_timeout_secs() -> u64 {
        10
    }
}

impl Default for FluentdSettings {
    fn default() -> Self {
        FluentdSettings {
            tag: Self::default_tag(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Ships batches to a Fluentd HTTP input as an array of
/// `[tag, epoch_seconds, record]` triples.
#[derive(Clone, Debug)]
pub struct FluentdShipper {
    endpoint: Url,
    settings: FluentdSettings,
    agent: RetryingAgent,
}

impl FluentdShipper {
    pub fn new(
        endpoint: Url,
        settings: FluentdSettings,
        api_metrics: &ApiClientMetricsCollector,
    ) -> FluentdShipper {
        FluentdShipper {
            endpoint,
            settings,
            agent: RetryingAgent::new("fluentd", api_metrics),
        }
    }

    fn body(&self, batch: &[LogEntry]) -> serde_json::Value {
        serde_json::Value::Array(
            batch
                .iter()
                .map(|entry| {
                    serde_json::json!([
                        self.settings.tag,
                        entry.timestamp.timestamp(),
                        {
                            "level": entry.level,
                            "message": entry.message,
                            "logger": entry.logger,
                            "fields": entry.fields,
                            "labels": entry.labels,
                        }
                    ])
                })
                .collect(),
        )
    }
}

impl Destination for FluentdShipper {
    fn kind(&self) -> &'static str {
        "fluentd"
    }

    fn deliver(&self, shipper: &str, batch: &[LogEntry]) -> Result<(), ShipperError> {
        let request = self.agent.prepare_request(&RequestParameters {
            url: self.endpoint.clone(),
            method: Method::Post,
            headers: Vec::new(),
            timeout: Some(Duration::from_secs(self.settings.timeout_secs)),
        });

        self.agent
            .send_json_once(&request, "emit", &self.body(batch))
            .map(|_| ())
            .map_err(|source| ShipperError::Http {
                shipper: shipper.to_owned(),
                source: Box::new(source),
            })
    }
}
