use crate::{
    entry::LogEntry,
    http::{Method, RequestParameters, RetryingAgent},
    metrics::ApiClientMetricsCollector,
    ship::{Destination, ShipperError},
};
use chrono::Utc;
use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct HttpShipperSettings {
    /// Maximum entries per request; larger batches are split.
    #[serde(default = "HttpShipperSettings::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "HttpShipperSettings::default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "HttpShipperSettings::default_source")]
    pub source: String,
    #[serde(default = "HttpShipperSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpShipperSettings {
    fn default_batch_size() -> usize {
        100
    }

    fn default_method() -> String {
        "POST".to_owned()
    }

    fn default_source() -> String {
        "watchtower".to_owned()
    }

    fn default_timeout_secs() -> u64 {
        10
    }
}

impl Default for HttpShipperSettings {
    fn default() -> Self {
        HttpShipperSettings {
            batch_size: Self::default_batch_size(),
            method: Self::default_method(),
            headers: Vec::new(),
            source: Self::default_source(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Ships batches to an arbitrary HTTP endpoint as a JSON envelope of
/// `{entries, timestamp, source, batch_size}`, splitting the batch to honor
/// the configured batch size.
#[derive(Clone, Debug)]
pub struct HttpShipper {
    endpoint: Url,
    settings: HttpShipperSettings,
    agent: RetryingAgent,
}

impl HttpShipper {
    pub fn new(
        endpoint: Url,
        settings: HttpShipperSettings,
        api_metrics: &ApiClientMetricsCollector,
    ) -> HttpShipper {
        HttpShipper {
            endpoint,
            settings,
            agent: RetryingAgent::new("http_shipper", api_metrics),
        }
    }

    fn envelope(&self, chunk: &[LogEntry]) -> serde_json::Value {
        serde_json::json!({
            "entries": chunk,
            "timestamp": Utc::now().to_rfc3339(),
            "source": self.settings.source,
            "batch_size": chunk.len(),
        })
    }
}

impl Destination for HttpShipper {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn deliver(&self, shipper: &str, batch: &[LogEntry]) -> Result<(), ShipperError> {
        let method = Method::from_str(&self.settings.method).unwrap_or(Method::Post);
        for chunk in batch.chunks(self.settings.batch_size.max(1)) {
            let request = self.agent.prepare_request(&RequestParameters {
                url: self.endpoint.clone(),
                method: method.clone(),
                headers: self.settings.headers.clone(),
                timeout: Some(Duration::from_secs(self.settings.timeout_secs)),
            });
            self.agent
                .send_json_once(&request, "ship", &self.envelope(chunk))
                .map_err(|source| ShipperError::Http {
                    shipper: shipper.to_owned(),
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogLevel;
    use mockito::mock;

    fn entries(count: usize) -> Vec<LogEntry> {
        (0..count)
            .map(|i| LogEntry::new(LogLevel::Info, &format!("entry {}", i), "app"))
            .collect()
    }

    #[test]
    fn envelope_shape() {
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name("http_env").unwrap();
        let shipper = HttpShipper::new(
            Url::parse("http://localhost:8080/logs").unwrap(),
            HttpShipperSettings::default(),
            &api_metrics,
        );
        let envelope = shipper.envelope(&entries(3));
        assert_eq!(envelope["batch_size"], 3);
        assert_eq!(envelope["source"], "watchtower");
        assert_eq!(envelope["entries"].as_array().unwrap().len(), 3);
        assert!(envelope["timestamp"].is_string());
    }

    #[test]
    fn splits_batches_to_honor_batch_size() {
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name("http_split").unwrap();
        let mocked = mock("POST", "/ship-split").with_status(200).expect(3).create();

        let shipper = HttpShipper::new(
            Url::parse(&format!("{}/ship-split", mockito::server_url())).unwrap(),
            HttpShipperSettings {
                batch_size: 2,
                ..HttpShipperSettings::default()
            },
            &api_metrics,
        );
        shipper.deliver("http", &entries(5)).unwrap();
        mocked.assert();
    }

    #[test]
    fn custom_method_and_headers() {
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name("http_custom").unwrap();
        let mocked = mock("PUT", "/ship-custom")
            .match_header("X-Api-Key", "secret")
            .with_status(200)
            .create();

        let shipper = HttpShipper::new(
            Url::parse(&format!("{}/ship-custom", mockito::server_url())).unwrap(),
            HttpShipperSettings {
                method: "PUT".to_owned(),
                headers: vec![("X-Api-Key".to_owned(), "secret".to_owned())],
                ..HttpShipperSettings::default()
            },
            &api_metrics,
        );
        shipper.deliver("http", &entries(1)).unwrap();
        mocked.assert();
    }
}
