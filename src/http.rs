use crate::{metrics::ApiClientMetricsCollector, retries::retry_request};
use slog::Logger;
use std::{
    fmt::Debug,
    time::{Duration, Instant},
};
use ureq::{Agent, AgentBuilder, Request, Response};
use url::Url;

/// Method contains the HTTP methods supported by this crate.
#[derive(Clone, Debug)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Converts the enum to a primitive string to be used by the ureq::Agent
    fn to_primitive_string(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = UnsupportedMethod;

    fn from_str(s: &str) -> Result<Self, UnsupportedMethod> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(UnsupportedMethod(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported HTTP method: {0}")]
pub struct UnsupportedMethod(String);

/// Parameters for a single outbound request: destination, method, extra
/// headers (shippers forward user-configured headers, Elasticsearch adds
/// its basic-auth header here) and an optional per-request timeout that
/// overrides the agent default.
#[derive(Clone, Debug)]
pub struct RequestParameters {
    pub url: Url,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestParameters {
    pub fn post(url: Url) -> RequestParameters {
        RequestParameters {
            url,
            method: Method::Post,
            headers: Vec::new(),
            timeout: None,
        }
    }
}

/// An HTTP agent wrapping `ureq::Agent` that records per-request latency
/// metrics and optionally retries transient failures with exponential
/// backoff. Shipper flushes use the single-attempt methods: a failed flush
/// leaves the shipper's buffer intact and the next ticker retries, so
/// stacking backoff on top would only delay the drain. Notification and
/// webhook actions use the retrying methods.
#[derive(Clone, Debug)]
pub struct RetryingAgent {
    /// Agent to use for constructing HTTP requests.
    agent: Agent,
    /// Requests which fail due to transport problems or which return any
    /// HTTP status code in this list or in the 5xx range are considered
    /// retryable.
    additional_retryable_http_status_codes: Vec<u16>,
    service: String,
    api_metrics: ApiClientMetricsCollector,
}

impl RetryingAgent {
    pub fn new_with_agent(
        agent: Agent,
        additional_retryable_http_status_codes: Vec<u16>,
        service: &str,
        api_metrics: &ApiClientMetricsCollector,
    ) -> Self {
        Self {
            agent,
            additional_retryable_http_status_codes,
            service: service.to_string(),
            api_metrics: api_metrics.clone(),
        }
    }

    /// Create a `RetryingAgent` with a `ureq::Agent` suitable for most uses
    /// and no additional retryable HTTP status codes.
    pub fn new(service: &str, api_metrics: &ApiClientMetricsCollector) -> Self {
        Self::new_with_agent(
            AgentBuilder::new().timeout(Duration::from_secs(10)).build(),
            vec![],
            service,
            api_metrics,
        )
    }

    /// Prepares a request for the provided `RequestParameters`, applying
    /// headers and the per-request timeout. Callers must use the `send_*`
    /// methods on this agent rather than `ureq::Request::call` directly to
    /// get latency metrics.
    pub fn prepare_request(&self, parameters: &RequestParameters) -> Request {
        let mut request = self
            .agent
            .request_url(parameters.method.to_primitive_string(), &parameters.url);
        for (name, value) in &parameters.headers {
            request = request.set(name, value);
        }
        if let Some(timeout) = parameters.timeout {
            request = request.timeout(timeout);
        }
        request
    }

    fn is_http_status_retryable(&self, http_status: u16) -> bool {
        http_status >= 500
            || self
                .additional_retryable_http_status_codes
                .contains(&http_status)
    }

    pub(crate) fn is_error_retryable(&self, error: &ureq::Error) -> bool {
        match error {
            ureq::Error::Status(http_status, _) => self.is_http_status_retryable(*http_status),
            ureq::Error::Transport(_) => true,
        }
    }

    /// Send the provided request with the provided JSON body, retrying
    /// transient failures with exponential backoff.
    pub fn send_json_request(
        &self,
        logger: &Logger,
        request: &Request,
        endpoint: &'static str,
        body: &serde_json::Value,
    ) -> Result<Response, ureq::Error> {
        retry_request(
            logger,
            || self.do_request_with_metrics(endpoint, || request.clone().send_json(body.clone())),
            |ureq_error| self.is_error_retryable(ureq_error),
        )
    }

    /// Send the provided request with the provided JSON body, making exactly
    /// one attempt.
    pub fn send_json_once(
        &self,
        request: &Request,
        endpoint: &'static str,
        body: &serde_json::Value,
    ) -> Result<Response, ureq::Error> {
        self.do_request_with_metrics(endpoint, || request.clone().send_json(body.clone()))
    }

    /// Send the provided request with the provided string body, making
    /// exactly one attempt. Used for newline-delimited JSON payloads whose
    /// content type the caller has already set.
    pub fn send_string_once(
        &self,
        request: &Request,
        endpoint: &'static str,
        body: &str,
    ) -> Result<Response, ureq::Error> {
        self.do_request_with_metrics(endpoint, || request.clone().send_string(body))
    }

    /// Send the provided request with no body, retrying transient failures.
    pub fn call(
        &self,
        logger: &Logger,
        request: &Request,
        endpoint: &'static str,
    ) -> Result<Response, ureq::Error> {
        retry_request(
            logger,
            || self.do_request_with_metrics(endpoint, || request.clone().call()),
            |ureq_error| self.is_error_retryable(ureq_error),
        )
    }

    /// Perform some operation `op`, logging metrics on the request status
    /// and latency.
    fn do_request_with_metrics<F>(
        &self,
        endpoint: &'static str,
        mut op: F,
    ) -> Result<Response, ureq::Error>
    where
        F: FnMut() -> Result<Response, ureq::Error>,
    {
        let before = Instant::now();
        let result = op();
        let latency = before.elapsed().as_millis();

        let http_status_label = match result {
            Ok(ref r) => r.status().to_string(),
            Err(ureq::Error::Status(http_status, _)) => http_status.to_string(),
            Err(_) => "unknown".to_owned(),
        };

        self.api_metrics
            .latency
            .with_label_values(&[&self.service, endpoint, &http_status_label])
            .observe(latency as f64);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use mockito::mock;
    use std::str::FromStr;

    #[test]
    fn retryable_error() {
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("retryable_error").unwrap();

        let http_400 = ureq::Error::Status(400, Response::new(400, "", "").unwrap());
        let http_429 = ureq::Error::Status(429, Response::new(429, "", "").unwrap());
        let http_500 = ureq::Error::Status(500, Response::new(500, "", "").unwrap());

        let mut agent = RetryingAgent::new("retryable_error", &api_metrics);
        assert!(!agent.is_error_retryable(&http_400));
        assert!(!agent.is_error_retryable(&http_429));
        assert!(agent.is_error_retryable(&http_500));

        agent.additional_retryable_http_status_codes = vec![429];

        assert!(agent.is_error_retryable(&http_429));
        assert!(!agent.is_error_retryable(&http_400));
    }

    #[test]
    fn custom_headers_and_method() {
        let logger = setup_test_logging();
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("custom_headers").unwrap();

        let mocked_put = mock("PUT", "/bulk")
            .match_header("X-Scope-OrgID", "tenant-1")
            .with_status(204)
            .create();

        let parameters = RequestParameters {
            url: Url::parse(&format!("{}/bulk", mockito::server_url())).unwrap(),
            method: Method::from_str("put").unwrap(),
            headers: vec![("X-Scope-OrgID".to_owned(), "tenant-1".to_owned())],
            timeout: Some(Duration::from_secs(2)),
        };

        let agent = RetryingAgent::new("custom_headers", &api_metrics);
        let request = agent.prepare_request(&parameters);
        let response = agent.call(&logger, &request, "bulk").unwrap();

        mocked_put.assert();
        assert_eq!(response.status(), 204);
    }

    #[test]
    fn single_attempt_does_not_retry() {
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("single_attempt").unwrap();

        let mocked_post = mock("POST", "/oneshot").with_status(503).expect(1).create();

        let parameters = RequestParameters::post(
            Url::parse(&format!("{}/oneshot", mockito::server_url())).unwrap(),
        );

        let agent = RetryingAgent::new("single_attempt", &api_metrics);
        let request = agent.prepare_request(&parameters);
        let error = agent
            .send_json_once(&request, "oneshot", &serde_json::json!({"entries": []}))
            .unwrap_err();

        mocked_post.assert();
        assert!(agent.is_error_retryable(&error));
    }
}
