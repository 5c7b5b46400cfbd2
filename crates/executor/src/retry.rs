use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::classify::{Classify, RetryClass};
use crate::config::RetryPolicy;

/// Runs a fallible async operation under a [`RetryPolicy`].
///
/// Fatal failures surface at once. Rate-limited and transient failures are
/// retried after the strategy's delay, floored by any wait the platform
/// asked for.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` until it succeeds, fails fatally, or the attempt budget runs out.
    ///
    /// `f` receives the 1-based attempt number. `op` names the operation in
    /// log output. The last error is returned once attempts are exhausted.
    pub async fn run<T, E, F, Fut>(&self, op: &str, mut f: F) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let class = err.classify();
                    if !class.is_retryable() || attempt >= max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_after(attempt, class);
                    warn!(
                        op,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn delay_after(&self, attempt: u32, class: RetryClass) -> Duration {
        let backoff = self.policy.strategy.delay_for(attempt - 1);
        match class {
            RetryClass::RateLimited {
                retry_after: Some(hint),
            } => backoff.max(hint),
            _ => backoff,
        }
    }
}
