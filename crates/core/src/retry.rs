//! Bounded retries for idempotent remote calls
//!
//! Transfer engines wrap single-part puts of an unchanged buffer, gets,
//! listings, part uploads and batch deletes in [`retry_with_backoff`]. The
//! sync engine never retries on its own; it surfaces failures instead.

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Backend messages that mark a transfer failure as transient
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "slow down",
    "slowdown",
    "internalerror",
    "service unavailable",
    "throttl",
];

/// Bounds for retrying a single remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Sleep before retry number `retry` (1-based), jitter included
    ///
    /// The exponential part is capped at `max_delay_ms`; up to half of it
    /// again is added as jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let exp = self
            .base_delay_ms
            .saturating_mul(1 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(exp + jitter(exp / 2))
    }
}

/// Jitter in `0..=bound` seeded from the clock
fn jitter(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let nanos = jiff::Timestamp::now().subsec_nanosecond().unsigned_abs() as u64;
    nanos % (bound + 1)
}

/// Run `operation` until it succeeds, fails permanently or runs out of
/// attempts
///
/// `is_retryable` decides which failures are worth another attempt. When the
/// budget is exhausted the last error is returned with the attempt count
/// added as context.
///
/// ```ignore
/// let page = retry_with_backoff(
///     &config,
///     || api.list_objects(&bucket, &prefix, token.clone()),
///     is_retryable_error,
/// ).await?;
/// ```
pub async fn retry_with_backoff<T, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&Error) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut retry = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !is_retryable(&err) {
            return Err(err);
        }
        if retry + 1 >= attempts {
            return Err(if attempts > 1 {
                err.context(format!("giving up after {attempts} attempts"))
            } else {
                err
            });
        }

        retry += 1;
        let delay = config.delay_for(retry);
        tracing::debug!(
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying remote call"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Whether an error is transient and the call that produced it may be
/// repeated
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Network(_) => true,
        Error::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
        ),
        Error::Transfer(msg) => {
            let msg = msg.to_lowercase();
            TRANSIENT_MARKERS.iter().any(|m| msg.contains(m))
        }
        _ => false,
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Clone, Default)]
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.config.base_delay_ms = ms;
        self
    }

    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.config.max_delay_ms = ms;
        self
    }

    /// Allow `retries` attempts after the first one
    pub fn retries(self, retries: u32) -> Self {
        self.max_attempts(retries.saturating_add(1))
    }

    /// Finish; zero attempts is raised to one
    pub fn build(self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.config.max_attempts.max(1),
            ..self.config
        }
    }
}
