//! Retry of transient upstream responses.
//!
//! A response with status 429 or any 5xx is retried after a fixed backoff,
//! up to a bounded number of total attempts. Exhausting the budget hands the
//! last response back as an ordinary `Ok` value; transport errors are never
//! retried here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pipeworks_types::throttle::RetryConfig;

use super::limiter::RateLimiter;
use super::state::Throttle;

/// Anything carrying an HTTP status code.
pub trait HttpStatus {
    fn status_code(&self) -> u16;
}

impl HttpStatus for u16 {
    fn status_code(&self) -> u16 {
        *self
    }
}

/// 429 Too Many Requests or any 5xx.
pub fn is_transient(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    limiter: RateLimiter,
}

impl RetryPolicy {
    /// The policy gets its own untracked limiter under `config.tag`.
    pub fn new(config: &RetryConfig, throttle: Arc<Throttle>) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
            limiter: RateLimiter::new(config.tag.clone(), config.interval(), throttle),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, status: u16, attempt: u32) -> bool {
        is_transient(status) && attempt < self.max_attempts
    }

    /// Run `request` until it yields a non-transient response or the
    /// attempt budget is spent.
    pub async fn run<F, Fut, T, E>(&self, mut request: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: HttpStatus,
    {
        let _permit = self.limiter.acquire().await;

        let mut attempt = 1;
        loop {
            let response = request().await?;
            let status = response.status_code();
            if !self.should_retry(status, attempt) {
                if is_transient(status) {
                    tracing::warn!(
                        status,
                        attempts = attempt,
                        "retry budget exhausted, returning last response"
                    );
                }
                return Ok(response);
            }

            tracing::warn!(
                status,
                attempt,
                max_attempts = self.max_attempts,
                backoff_secs = self.backoff.as_secs(),
                "transient upstream response, retrying"
            );
            tokio::time::sleep(self.backoff).await;
            attempt += 1;
        }
    }
}
