use backoff::{retry, ExponentialBackoff};
use slog::{debug, info, Logger};
use std::{fmt::Debug, time::Duration};

/// Backoff intervals used for outbound HTTP calls made by notification
/// actions and shipper connectivity tests. Shipper flushes deliberately do
/// NOT retry in-line: a failed flush leaves the buffer intact and the next
/// ticker fires soon enough.
pub(crate) struct RetryParameters {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryParameters {
    fn default() -> Self {
        RetryParameters {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(120),
        }
    }
}

/// Executes the provided action `f`, retrying with exponential backoff if the
/// error returned by `f` is deemed retryable by `is_retryable`. On success,
/// returns the value returned by `f`. On failure, returns the error returned
/// by the last attempt to call `f`. Retryable failures are logged using the
/// provided logger.
pub(crate) fn retry_request<F, T, E, R>(logger: &Logger, f: F, is_retryable: R) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
    E: Debug,
{
    retry_request_with_params(logger, RetryParameters::default(), f, is_retryable)
}

fn retry_request_with_params<F, T, E, R>(
    logger: &Logger,
    parameters: RetryParameters,
    mut f: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
    E: Debug,
{
    let backoff = ExponentialBackoff {
        initial_interval: parameters.initial_interval,
        max_interval: parameters.max_interval,
        multiplier: 2.0,
        max_elapsed_time: Some(parameters.max_elapsed),
        ..Default::default()
    };

    retry(backoff, || {
        // Invoke the function and wrap its E into backoff::Error
        f().map_err(|error| {
            if is_retryable(&error) {
                info!(
                    logger, "encountered retryable error";
                    "error" => format!("{:?}", error),
                );
                backoff::Error::transient(error)
            } else {
                debug!(logger, "encountered non-retryable error");
                backoff::Error::Permanent(error)
            }
        })
    })
    // Unwrap the backoff::Error to get the E back and let the caller wrap
    // that in whatever they want
    .map_err(|e| match e {
        backoff::Error::Permanent(inner) => inner,
        backoff::Error::Transient { err: inner, .. } => inner,
    })
}
