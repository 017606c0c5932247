use anyhow::{Context, Result};
use http::Response;
use log::{error, info};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::runtime::Runtime;
use warp::Filter;

/// Starts listening on an HTTP endpoint so that Prometheus can scrape metrics
/// from this instance. On success, returns a Runtime value that the caller
/// must keep live, or the task that handles Prometheus scrapes will not run.
/// Returns an error if something goes wrong setting up the endpoint.
pub fn start_metrics_scrape_endpoint(port: u16) -> Result<Runtime> {
    // The default, multi-threaded runtime should suffice for our needs
    let runtime = Runtime::new().context("failed to create runtime for metrics endpoint")?;

    // This task will run forever, so we intentionally drop the returned handle
    runtime.spawn(async move {
        let endpoint = warp::get().and(warp::path("metrics")).map(|| {
            match handle_scrape() {
                Ok(body) => {
                    Response::builder()
                        // https://github.com/prometheus/docs/blob/master/content/docs/instrumenting/exposition_formats.md
                        .header("Content-Type", "text/plain; version=0.0.4")
                        .body(body)
                }
                Err(err) => {
                    error!("unable to scrape Prometheus metrics: {}", err);
                    Response::builder().status(500).body(vec![])
                }
            }
        });

        info!("serving metrics scrapes on 0.0.0.0:{}", port);
        warp::serve(endpoint)
            .run(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
            .await;
    });

    Ok(runtime)
}

fn handle_scrape() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// A group of collectors for the logging pipeline hot path.
#[derive(Clone, Debug)]
pub struct PipelineMetricsCollector {
    /// Entries accepted into the pipeline, labeled by level, logger and
    /// output ("centralized" for the ingest counter itself).
    pub entries_total: IntCounterVec,
    /// Entries dropped before reaching any sink, labeled by reason.
    pub entries_dropped: IntCounterVec,
    /// Wall-clock duration of each processor invocation.
    pub processor_duration: HistogramVec,
    /// Write failures per output sink.
    pub output_errors: IntCounterVec,
    /// Failures to index an entry.
    pub index_errors: IntCounterVec,
}

impl PipelineMetricsCollector {
    pub fn new() -> Result<PipelineMetricsCollector> {
        let entries_total = register_int_counter_vec!(
            "watchtower_entries_total",
            "Number of log entries accepted into the pipeline",
            &["level", "logger", "output"]
        )
        .context("failed to register metrics counter for entries")?;

        let entries_dropped = register_int_counter_vec!(
            "watchtower_entries_dropped",
            "Number of log entries dropped before delivery",
            &["reason"]
        )
        .context("failed to register metrics counter for dropped entries")?;

        let processor_duration = register_histogram_vec!(
            "watchtower_processor_duration_seconds",
            "Time spent in each pipeline processor",
            &["processor"]
        )
        .context("failed to register histogram for processor durations")?;

        let output_errors = register_int_counter_vec!(
            "watchtower_output_errors_total",
            "Number of failed writes per output sink",
            &["output"]
        )
        .context("failed to register metrics counter for output errors")?;

        let index_errors = register_int_counter_vec!(
            "watchtower_index_errors_total",
            "Number of entries that could not be indexed",
            &["index"]
        )
        .context("failed to register metrics counter for index errors")?;

        Ok(PipelineMetricsCollector {
            entries_total,
            entries_dropped,
            processor_duration,
            output_errors,
            index_errors,
        })
    }
}

/// A group of collectors for the shipping subsystem.
#[derive(Clone, Debug)]
pub struct ShipperMetricsCollector {
    /// Batches flushed per shipper, labeled by status (success/failure).
    pub batches_shipped: IntCounterVec,
    /// Entries successfully delivered per shipper.
    pub entries_shipped: IntCounterVec,
    /// Entries currently buffered per shipper.
    pub buffered_entries: IntGaugeVec,
    /// Entries dropped because a shipper's buffer hit its hard ceiling or
    /// could not be drained at shutdown.
    pub entries_dropped: IntCounterVec,
}

impl ShipperMetricsCollector {
    pub fn new() -> Result<ShipperMetricsCollector> {
        let batches_shipped = register_int_counter_vec!(
            "watchtower_shipper_batches_total",
            "Number of batches flushed per shipper",
            &["shipper", "status"]
        )
        .context("failed to register metrics counter for shipped batches")?;

        let entries_shipped = register_int_counter_vec!(
            "watchtower_shipper_entries_total",
            "Number of entries delivered per shipper",
            &["shipper"]
        )
        .context("failed to register metrics counter for shipped entries")?;

        let buffered_entries = register_int_gauge_vec!(
            "watchtower_shipper_buffered_entries",
            "Number of entries currently buffered per shipper",
            &["shipper"]
        )
        .context("failed to register gauge for buffered entries")?;

        let entries_dropped = register_int_counter_vec!(
            "watchtower_shipper_dropped_entries",
            "Number of entries dropped per shipper",
            &["shipper"]
        )
        .context("failed to register metrics counter for dropped shipper entries")?;

        Ok(ShipperMetricsCollector {
            batches_shipped,
            entries_shipped,
            buffered_entries,
            entries_dropped,
        })
    }
}

/// A group of collectors for the alert evaluation engine.
#[derive(Clone, Debug)]
pub struct AlertMetricsCollector {
    /// Rule evaluations, labeled by rule id and outcome
    /// (fired/quiet/skipped).
    pub evaluations_total: IntCounterVec,
    /// Action executions, labeled by action type and status.
    pub actions_total: IntCounterVec,
}

impl AlertMetricsCollector {
    pub fn new() -> Result<AlertMetricsCollector> {
        let evaluations_total = register_int_counter_vec!(
            "watchtower_alert_evaluations_total",
            "Number of alert rule evaluations",
            &["rule", "outcome"]
        )
        .context("failed to register metrics counter for rule evaluations")?;

        let actions_total = register_int_counter_vec!(
            "watchtower_alert_actions_total",
            "Number of alert actions executed",
            &["type", "status"]
        )
        .context("failed to register metrics counter for alert actions")?;

        Ok(AlertMetricsCollector {
            evaluations_total,
            actions_total,
        })
    }
}

/// A group of collectors for outbound HTTP API clients (shippers, webhooks).
#[derive(Clone, Debug)]
pub struct ApiClientMetricsCollector {
    pub latency: HistogramVec,
}

impl ApiClientMetricsCollector {
    pub fn new() -> Result<ApiClientMetricsCollector> {
        Self::new_with_metric_name("api_client")
    }

    /// Creates a collector whose metric is prefixed with `name`. Tests use
    /// distinct names because the process-global prometheus registry rejects
    /// duplicate registrations.
    pub fn new_with_metric_name(name: &str) -> Result<ApiClientMetricsCollector> {
        let latency = register_histogram_vec!(
            format!("watchtower_{}_request_latency_ms", name),
            "Latency of outbound HTTP requests",
            &["service", "endpoint", "http_status"]
        )
        .context("failed to register histogram for API client latency")?;

        Ok(ApiClientMetricsCollector { latency })
    }
}
