//! # Retry Policy
//!
//! Bounded retry around transaction sends that fail because the relayer connection
//! dropped. Only errors whose message contains one of the configured transient patterns
//! are retried; anything else propagates on the first attempt.
//!
//! After the n-th transient failure the policy sleeps `base_delay * n` before the next
//! attempt, so the default policy waits 2s then 4s across its three attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::types::GlucoseCheckError;

/// Messages that identify a dropped relayer connection
pub const TRANSIENT_PATTERNS: [&str; 3] = [
    "Relayer didn't response",
    "backend connection task has stopped",
    "Transaction rejected",
];

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("Relayer connection error. Please try again later or switch to a local devnet.")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: GlucoseCheckError,
    },

    #[error("{0}")]
    Fatal(GlucoseCheckError),

    #[error("Operation abandoned: session changed")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub transient_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            transient_patterns: TRANSIENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    pub fn is_transient(&self, error: &GlucoseCheckError) -> bool {
        let message = error.to_string();
        self.transient_patterns.iter().any(|p| message.contains(p.as_str()))
    }

    /// Wait before the attempt that follows the `failures`-th transient failure.
    /// Saturates at `Duration::MAX`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.base_delay.checked_mul(failures).unwrap_or(Duration::MAX)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `is_stale` is consulted before every attempt; `on_retry` receives the number of
    /// attempts left whenever a transient failure is about to be retried.
    pub async fn run<T, F, Fut>(
        &self,
        mut op: F,
        is_stale: impl Fn() -> bool,
        on_retry: impl Fn(u32),
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GlucoseCheckError>>,
    {
        let mut failures = 0u32;
        loop {
            if is_stale() {
                return Err(RetryError::Aborted);
            }

            let attempt = failures + 1;
            match op(attempt).await {
                Ok(value) => {
                    if failures > 0 {
                        debug!("Succeeded on attempt {}/{}", attempt, self.max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) if self.is_transient(&e) => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        warn!("Giving up after {} attempts: {}", failures, e);
                        return Err(RetryError::Exhausted {
                            attempts: failures,
                            last_error: e,
                        });
                    }
                    let remaining = self.max_attempts - failures;
                    let delay = self.delay_after(failures);
                    warn!(
                        "Transient relayer failure (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.max_attempts, delay, e
                    );
                    on_retry(remaining);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(RetryError::Fatal(e)),
            }
        }
    }
}
