use anyhow::{anyhow, Context, Result};
use atty::{self, Stream};
use slog::{o, Drain, FnValue, Level, LevelFilter, Logger, PushFnValue};
use slog_json::Json;
use slog_scope::GlobalLoggerGuard;
use slog_term::{FullFormat, PlainSyncDecorator, TermDecorator, TestStdoutWriter};
use std::{
    io::{stderr, Stderr},
    str::FromStr,
};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// `event` defines constants for structured events
pub mod event {
    /// An event key is a key that could be encountered in the fields of a
    /// structured log message.
    type EventKey = &'static str;

    /// The name of an output sink
    pub(crate) const OUTPUT: EventKey = "output";
    /// The name of a shipper
    pub(crate) const SHIPPER: EventKey = "shipper";
    /// The name of a processor in the chain
    pub(crate) const PROCESSOR: EventKey = "processor";
    /// The number of entries in a shipped batch
    pub(crate) const BATCH_SIZE: EventKey = "batch_size";
    /// The identifier of an alert rule
    pub(crate) const RULE_ID: EventKey = "rule_id";
    /// The identifier of an alert instance
    pub(crate) const INSTANCE_ID: EventKey = "instance_id";
    /// The type of an alert action
    pub(crate) const ACTION_TYPE: EventKey = "action_type";
    /// The identifier of a WebSocket client
    pub(crate) const CLIENT_ID: EventKey = "client_id";
}

/// Options for configuring logging in this application
pub struct LoggingConfiguration<'a> {
    /// If true, logging output will be forced to JSON format using
    /// [slog-json][1]. If false, logging format will be determined by
    /// detecting whether `stderr` is a `tty`. If it is, output is formatted
    /// using [slog-term][2]. Otherwise, `slog-json` is used.
    ///
    /// [1]: https://docs.rs/slog-json
    /// [2]: https://docs.rs/slog-term
    pub force_json_output: bool,
    /// A version string which shall be attached to all log messages
    pub version_string: &'a str,
    /// Messages above this log level will be discarded
    pub log_level: &'a str,
}

/// IoErrorDrain is a supertrait that lets us work generically with
/// `slog::Drain`s.
trait IoErrorDrain: Drain<Ok = (), Err = std::io::Error> + Send {}

impl IoErrorDrain for Json<Stderr> {}
impl IoErrorDrain for FullFormat<TermDecorator> {}

/// Initialize logging resources. On success, returns a root
/// [`slog::Logger`][1] from which modules should create child loggers to add
/// more key-value pairs to the events they log, and a
/// [`slog_scope::GlobalLoggerGuard`], which must be kept live by the caller.
/// Returns an error if `LoggingConfiguration` is invalid.
///
/// [1]: https://docs.rs/slog/2.7.0/slog/struct.Logger.html
pub fn setup_logging(config: &LoggingConfiguration) -> Result<(Logger, GlobalLoggerGuard)> {
    // If stderr is not a tty, emit JSON log structures on the assumption
    // that we are running under a supervisor that collects them.
    let json_output = atty::isnt(Stream::Stderr) || config.force_json_output;

    // We have to box the Drain so that both branches return the same type
    let drain: Box<dyn IoErrorDrain> = if json_output {
        let json_drain = Json::new(stderr())
            .set_newlines(true)
            .add_key_value(o!(
                "time" => FnValue(|_| {
                    chrono::Utc::now().to_rfc3339()
                }),
                "severity" => FnValue(|record| {
                    record.level().as_str()
                }),
                "message" => PushFnValue(|record, serializer| {
                    serializer.emit(record.msg())
                }),
            ))
            .build();
        Box::new(json_drain)
    } else {
        let decorator = TermDecorator::new().stderr().build();
        Box::new(FullFormat::new(decorator).build())
    };

    // Create a filter to discard messages above desired level
    let log_level = Level::from_str(config.log_level)
        .map_err(|_| anyhow!("{} is not a valid log level", config.log_level))?;
    let level_filter = LevelFilter::new(drain, log_level);

    // Use slog_async to make it safe to clone loggers across threads
    let drain = slog_async::Async::new(level_filter.fuse()).build().fuse();
    let root_logger = Logger::root(
        drain,
        o!(
            "version" => config.version_string.to_owned(),
            "module_path" => FnValue(|record| {
                record.module()
            }),
        ),
    );

    // Register the root logger in the global scope and capture messages
    // emitted by dependencies that use the `log` crate
    let scope_guard = slog_scope::set_global_logger(root_logger.clone());
    slog_stdlog::init().context("failed to initialize slog as log backend")?;

    // Also install a tracing subscriber to capture trace events from
    // dependencies like tokio and warp
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_level(true)
        .with_target(true);

    let fmt_layer: Box<dyn tracing_subscriber::layer::Layer<_> + Send + Sync> = if json_output {
        Box::new(fmt_layer.json())
    } else {
        Box::new(fmt_layer.pretty())
    };

    let subscriber = Registry::default()
        .with(fmt_layer)
        // Configure filters with the RUST_LOG env var
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();

    Ok((root_logger, scope_guard))
}

/// Initialize logging for unit or integration tests. Must be public for
/// visibility in integration tests.
pub fn setup_test_logging() -> Logger {
    let decorator = PlainSyncDecorator::new(TestStdoutWriter);
    let drain = FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}
