//! Retry and backoff.
//!
//! Each attempt reports an [`Attempt`] outcome; [`RetryPolicy::run`] loops
//! over attempts, sleeping for the [`Backoff`] delay between retryable
//! failures and giving up after `max_retries + 1` attempts. The backoff is a
//! trait object so tests can substitute [`NoBackoff`] or a recording strategy
//! and exercise the give-up logic without real sleeps.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::McpError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Delay strategy between attempts.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// Delay before retry number `retry` (1 for the first retry).
    fn delay(&self, retry: u32) -> Duration;
}

/// Doubles the delay on every retry: `base`, `2 * base`, `4 * base`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `base`, capped at 30 s.
    #[must_use]
    pub const fn new(base: Duration) -> Self {
        Self {
            base,
            max: Duration::from_secs(30),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE)
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Retries immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _retry: u32) -> Duration {
        Duration::ZERO
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The attempt succeeded.
    Success(T),
    /// The attempt failed in a way worth retrying.
    Retryable(McpError),
    /// The attempt failed and retrying cannot help.
    Fatal(McpError),
}

impl<T> Attempt<T> {
    /// Classifies a result using [`McpError::is_recoverable`].
    pub fn from_result(result: Result<T, McpError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) if e.is_recoverable() => Self::Retryable(e),
            Err(e) => Self::Fatal(e),
        }
    }
}

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay strategy.
    pub backoff: Arc<dyn Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_retries: u32, backoff: impl Backoff + 'static) -> Self {
        Self {
            max_retries,
            backoff: Arc::new(backoff),
        }
    }

    /// Total attempts the policy allows.
    #[must_use]
    pub const fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Drives `attempt` until it succeeds, fails fatally, or the attempts run
    /// out. `attempt` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns a fatal error unchanged, or [`McpError::RetriesExhausted`]
    /// wrapping the last retryable error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, McpError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let total = self.total_attempts();
        let mut number = 0;
        loop {
            number += 1;
            match attempt(number).await {
                Attempt::Success(value) => {
                    if number > 1 {
                        debug!(operation, attempt = number, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) => {
                    if number >= total {
                        return Err(McpError::RetriesExhausted {
                            method: operation.to_string(),
                            attempts: number,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.backoff.delay(number);
                    warn!(operation, attempt = number, ?delay, error = %e, "Attempt failed; retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
