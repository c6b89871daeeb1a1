// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Transport retry with exponential backoff.
//!
//! Only errors classified retryable by [`ModelError::is_retryable`] are
//! retried: transport failures, HTTP 429 and any 5xx.  Schema-depth and
//! invalid-argument errors fail fast.  The chat session layers its own
//! empty-stream retry and the quota fallback-model switch on top of this.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::ModelError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied per attempt (2.0 doubles the delay each time).
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Backoff delay before retrying after `attempt` (0-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exp = base * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `op` under the retry policy.  `op` receives the 0-based attempt index.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    mut op: F,
) -> Result<T, ModelError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for(attempt);
                debug!(attempt, ?delay, error = %e, "retrying after transient error");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_config() -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn success_on_first_attempt_makes_one_call() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_config(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ModelError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_config(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ModelError::Http { status: 503, body: "busy".into() })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_config(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ModelError::InvalidArgument { message: "bad".into(), tools: vec![] })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let result: Result<(), _> = retry_with_backoff(&fast_config(), |_| async {
            Err(ModelError::Quota { body: "429".into() })
        })
        .await;
        assert!(result.err().unwrap().is_quota());
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(350)); // capped
        assert_eq!(cfg.delay_for(5), Duration::from_millis(350));
    }
}
