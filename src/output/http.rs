use crate::{
    entry::{LogEntry, LogLevel},
    output::{Output, OutputError},
};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct HttpOutputSettings {
    pub endpoint: String,
    /// Seconds before an in-flight request is abandoned.
    #[serde(default = "HttpOutputSettings::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl HttpOutputSettings {
    fn default_timeout_secs() -> u64 {
        5
    }
}

/// POSTs each entry as a JSON document. The request timeout bounds how long
/// a write can stall the pipeline; delivery that cannot keep up belongs in
/// a shipper instead.
#[derive(Debug)]
pub struct HttpOutput {
    name: String,
    level: LogLevel,
    agent: ureq::Agent,
    endpoint: Url,
    headers: Vec<(String, String)>,
}

impl HttpOutput {
    pub fn new(
        name: &str,
        level: LogLevel,
        settings: HttpOutputSettings,
    ) -> Result<HttpOutput, url::ParseError> {
        let endpoint = Url::parse(&settings.endpoint)?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build();
        Ok(HttpOutput {
            name: name.to_owned(),
            level,
            agent,
            endpoint,
            headers: settings.headers,
        })
    }
}

impl Output for HttpOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn level_floor(&self) -> LogLevel {
        self.level
    }

    fn write(&mut self, entry: &LogEntry) -> Result<(), OutputError> {
        let mut request = self.agent.request_url("POST", &self.endpoint);
        for (header, value) in &self.headers {
            request = request.set(header, value);
        }
        request
            .send_json(serde_json::json!(entry))
            .map_err(|source| OutputError::Http {
                name: self.name.clone(),
                source: Box::new(source),
            })?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        // Requests are not buffered.
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::mock;

    fn test_output(path: &str, status: usize) -> (HttpOutput, mockito::Mock) {
        let mocked = mock("POST", path).with_status(status).create();
        let output = HttpOutput::new(
            "http",
            LogLevel::Debug,
            HttpOutputSettings {
                endpoint: format!("{}{}", mockito::server_url(), path),
                timeout_secs: 2,
                headers: vec![("X-Api-Key".to_owned(), "secret".to_owned())],
            },
        )
        .unwrap();
        (output, mocked)
    }

    #[test]
    fn posts_entry_as_json() {
        let (mut output, mocked) = test_output("/out-ok", 200);
        output
            .write(&LogEntry::new(LogLevel::Info, "delivered", "app"))
            .unwrap();
        mocked.assert();
    }

    #[test]
    fn server_error_surfaces() {
        let (mut output, _mocked) = test_output("/out-err", 500);
        let error = output
            .write(&LogEntry::new(LogLevel::Info, "rejected", "app"))
            .unwrap_err();
        assert!(matches!(error, OutputError::Http { .. }));
    }
}
