use anyhow::{Context, Result};
use clap::{value_t, App, Arg};
use signal_hook::{consts::SIGINT, consts::SIGTERM, iterator::Signals};
use slog::{info, Logger};
use std::{path::Path, sync::Arc, time::Duration};
use url::Url;
use watchtower::{
    alert::{
        action::{ActionExecutor, WebhookNotifier},
        digest::{DigestCollector, DigestConfig, EmailSender},
        manager::AlertManager,
        provider::MemoryMetricStore,
        AlertInstance,
    },
    api::{start_api_server, ApiState},
    config::CentralizedLoggingConfig,
    http::RetryingAgent,
    hub::Hub,
    logger::CentralizedLogger,
    logging::{setup_logging, LoggingConfiguration},
    metrics::{
        start_metrics_scrape_endpoint, AlertMetricsCollector, ApiClientMetricsCollector,
        PipelineMetricsCollector, ShipperMetricsCollector,
    },
    version_string,
};

/// An e-mail sender that renders to the process log. Wiring a real SMTP
/// relay (and its HTML templates) is deployment plumbing that lives
/// outside this binary.
#[derive(Debug)]
struct LoggingEmailSender {
    logger: Logger,
}

impl EmailSender for LoggingEmailSender {
    fn send_immediate(&self, instance: &AlertInstance) -> Result<()> {
        info!(
            self.logger, "immediate alert e-mail";
            "rule" => instance.rule_name.clone(),
            "severity" => instance.severity.to_string(),
        );
        Ok(())
    }

    fn send_digest(&self, subject: &str, _body: &str) -> Result<()> {
        info!(self.logger, "digest e-mail"; "subject" => subject.to_owned());
        Ok(())
    }
}

fn main() -> Result<()> {
    let version = version_string();
    let matches = App::new("watchtower")
        .version(version.as_str())
        .about("In-process observability platform: log pipeline, search, alerting")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("Path to the logging configuration document (JSON)"),
        )
        .arg(
            Arg::with_name("api-port")
                .long("api-port")
                .default_value("8080")
                .help("Port for the HTTP/WebSocket API"),
        )
        .arg(
            Arg::with_name("metrics-port")
                .long("metrics-port")
                .default_value("9090")
                .help("Port for Prometheus metrics scrapes"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .default_value("info")
                .help("Minimum level for the daemon's own logs"),
        )
        .arg(
            Arg::with_name("force-json-log-output")
                .long("force-json-log-output")
                .help("Force JSON log output even on a tty"),
        )
        .arg(
            Arg::with_name("eval-interval")
                .long("eval-interval")
                .default_value("30")
                .help("Seconds between alert rule evaluation cycles"),
        )
        .arg(
            Arg::with_name("slack-webhook-url")
                .long("slack-webhook-url")
                .value_name("URL")
                .help("Incoming-webhook URL backing the slack notification channel"),
        )
        .arg(
            Arg::with_name("discord-webhook-url")
                .long("discord-webhook-url")
                .value_name("URL")
                .help("Incoming-webhook URL backing the discord notification channel"),
        )
        .arg(
            Arg::with_name("teams-webhook-url")
                .long("teams-webhook-url")
                .value_name("URL")
                .help("Incoming-webhook URL backing the teams notification channel"),
        )
        .get_matches();

    let (root_logger, _guard) = setup_logging(&LoggingConfiguration {
        force_json_output: matches.is_present("force-json-log-output"),
        version_string: &version,
        log_level: matches.value_of("log-level").unwrap_or("info"),
    })?;

    let config = match matches.value_of("config") {
        Some(path) => CentralizedLoggingConfig::from_file(Path::new(path))
            .with_context(|| format!("loading configuration from {}", path))?,
        None => CentralizedLoggingConfig::default(),
    };

    let api_port = value_t!(matches.value_of("api-port"), u16)?;
    let metrics_port = value_t!(matches.value_of("metrics-port"), u16)?;
    let eval_interval = value_t!(matches.value_of("eval-interval"), u64)?;

    let pipeline_metrics =
        PipelineMetricsCollector::new().context("registering pipeline metrics")?;
    let shipper_metrics =
        ShipperMetricsCollector::new().context("registering shipper metrics")?;
    let alert_metrics = AlertMetricsCollector::new().context("registering alert metrics")?;
    let api_metrics = ApiClientMetricsCollector::new().context("registering client metrics")?;

    let hub = Hub::new(config.streaming.buffer_size, &version, &root_logger);

    let mut pipeline =
        CentralizedLogger::new(config, Arc::clone(&hub), &version, &api_metrics, &root_logger)?;
    pipeline.set_metrics_collectors(&pipeline_metrics, &shipper_metrics);
    let pipeline = Arc::new(pipeline);
    CentralizedLogger::start(&pipeline);

    let metric_store = Arc::new(MemoryMetricStore::new(4096));

    let digest = Arc::new(DigestCollector::new(
        DigestConfig::default(),
        Box::new(LoggingEmailSender {
            logger: root_logger.clone(),
        }),
        &root_logger,
    ));
    DigestCollector::start(&digest);

    let mut executor = ActionExecutor::new(
        RetryingAgent::new("alert_actions", &api_metrics),
        &root_logger,
    );
    executor.set_digest(Arc::clone(&digest));
    executor.set_metrics_collector(&alert_metrics);
    for channel in ["slack", "discord", "teams"] {
        if let Some(webhook_url) = matches.value_of(format!("{}-webhook-url", channel).as_str()) {
            let url = Url::parse(webhook_url)
                .with_context(|| format!("parsing {} webhook URL", channel))?;
            executor.register_notifier(
                channel,
                Box::new(WebhookNotifier::new(
                    url,
                    RetryingAgent::new(channel, &api_metrics),
                    root_logger.clone(),
                )),
            );
        }
    }

    let mut alerts = AlertManager::new(
        Arc::clone(&metric_store) as Arc<dyn watchtower::alert::provider::MetricProvider>,
        executor,
        Duration::from_secs(eval_interval.max(1)),
        &root_logger,
    );
    alerts.set_hub(Arc::clone(&hub));
    alerts.set_metrics_collector(&alert_metrics);
    let alerts = Arc::new(alerts);
    AlertManager::start(&alerts);

    let _metrics_runtime = start_metrics_scrape_endpoint(metrics_port)?;
    let _api_runtime = start_api_server(
        ApiState {
            pipeline: Arc::clone(&pipeline),
            alerts: Arc::clone(&alerts),
            metric_store,
        },
        api_port,
        &root_logger,
    )?;

    info!(root_logger, "watchtower started"; "version" => version.clone());

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to register signal handler")?;
    let received = signals.forever().next();
    info!(root_logger, "shutting down"; "signal" => format!("{:?}", received));

    alerts.stop();
    digest.stop();
    pipeline.shutdown();

    Ok(())
}
