// Retry controller
//
// Wraps connector calls. Transient failures are retried with exponential
// backoff; permanent failures and exhausted retries surface immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::ConnectorError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Scale each backoff delay by a random factor in 0.9..=1.1
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// `base_delay * backoff_factor^attempt`, capped at `max_delay`. A
    /// server-supplied `Retry-After` is a lower bound.
    pub fn delay_for(&self, attempt: u32, error: &ConnectorError) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let mut secs = backoff.min(self.max_delay.as_secs_f64());
        if self.jitter {
            secs *= rand::rng().random_range(0.9..=1.1);
        }
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay);

        match error.retry_after {
            Some(retry_after) if retry_after > delay => retry_after,
            _ => delay,
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, &error);
                    tracing::debug!(
                        "Retry attempt {} for {} after {:?} due to: {}",
                        attempt + 1,
                        label,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    if error.is_transient() {
                        tracing::warn!("Giving up on {} after {} retries: {}", label, attempt, error);
                    }
                    return Err(error);
                }
            }
        }
    }
}
