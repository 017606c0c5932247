#![allow(clippy::too_many_arguments)]

pub mod alert;
pub mod api;
pub mod config;
pub mod entry;
pub mod http;
pub mod hub;
pub mod index;
pub mod logger;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod parse;
pub mod processor;
mod retries;
pub mod ship;
pub mod test_utils;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
    #[error("HTTP resource error: {0}")]
    HttpError(#[from] ureq::Error),
    #[error("error parsing time: {0}")]
    TimeParse(#[from] chrono::ParseError),
    #[error("command line parsing error: {0}")]
    Clap(#[from] clap::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Output(#[from] output::OutputError),
    #[error(transparent)]
    Shipper(#[from] ship::ShipperError),
    #[error(transparent)]
    Index(#[from] index::IndexError),
    #[error(transparent)]
    Condition(#[from] alert::condition::ConditionError),
    #[error(transparent)]
    Action(#[from] alert::action::ActionError),
}

/// This trait captures whether a given error is transient, in which case the
/// operation that produced it should be retried at a later time (a shipper
/// flush that hit a 503, say), or permanent, in which case retrying would
/// only repeat the failure (a malformed alert condition).
pub trait ErrorClassification {
    fn is_retryable(&self) -> bool;
}

impl ErrorClassification for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Catch-all error type -- retries OK.
            Error::AnyhowError(_) => true,
            // Errors from ureq are obviously retryable.
            Error::HttpError(_) => true,
            // These indicate a problem with how the process was invoked or
            // configured; they will not go away on their own.
            Error::Clap(_) | Error::TimeParse(_) | Error::Config(_) => false,
            // Dispatch to the wrapped error type.
            Error::Output(e) => e.is_retryable(),
            Error::Shipper(e) => e.is_retryable(),
            Error::Index(_) => false,
            Error::Condition(e) => e.is_retryable(),
            Error::Action(e) => e.is_retryable(),
        }
    }
}

/// The version string attached to log output, the hub's initial-state
/// message and the stats API.
pub fn version_string() -> String {
    format!("{}-{}", env!("VERGEN_SEMVER"), env!("VERGEN_SHA_SHORT"))
}
