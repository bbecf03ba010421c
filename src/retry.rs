//! Caller-side retry with exponential backoff
//!
//! The distribution client never retries on its own: resubmitting a query
//! too eagerly is exactly what triggers the service's rate limiting. Callers
//! that want retries wrap a whole sync in [`with_retry`], which only retries
//! errors classified as transient by [`IsRetryable`].
//!
//! # Example
//!
//! ```no_run
//! use sefaz_dfe::config::RetryConfig;
//! use sefaz_dfe::error::Error;
//! use sefaz_dfe::retry::with_retry;
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::default();
//! let answer = with_retry(&config, || async { Ok::<u32, Error>(42) }).await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, TransportError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (connect errors, timeouts, 5xx answers) return `true`.
/// Everything the service or the caller rejected returns `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connect(_) | TransportError::Timeout(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
            // A bad bundle or passphrase stays bad
            TransportError::Certificate(_) => false,
            TransportError::Request(_) => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Remote rejections, malformed envelopes and cool-downs must not be hammered
            Error::RemoteStatus { .. } | Error::EnvelopeParse(_) | Error::CoolingDown { .. } => {
                false
            }
            Error::Config { .. }
            | Error::InvalidInput { .. }
            | Error::UnknownIdentity(_)
            | Error::Crypto(_)
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Serialization(_)
            | Error::Other(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// The operation runs once, then up to `config.max_attempts` more times
/// while it fails with a retryable error. Returns the successful result or
/// the last error.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };
                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
