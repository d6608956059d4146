use assay_core::{AssayError, AssayResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Configures retry behaviour for idempotent calls (worker dispatch, LLM).
///
/// The delay between attempt `n` and `n + 1` is
/// `min(max_delay, base_delay * backoff_multiplier^(n - 1))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Determines whether an error is transient and worth retrying.
///
/// Transport, HTTP, LLM and I/O failures are retried. Circuit rejections,
/// dispatch timeouts, routing, lifecycle and configuration errors are terminal.
pub fn is_retryable(err: &AssayError) -> bool {
    matches!(
        err,
        AssayError::Worker(_) | AssayError::Http(_) | AssayError::Llm(_) | AssayError::Io(_)
    )
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or attempts
    /// run out. Returns the last error in the latter two cases.
    pub async fn retry<T, F, Fut>(&self, op: F) -> AssayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AssayResult<T>>,
    {
        self.retry_if(op, is_retryable).await
    }

    /// Like [`RetryPolicy::retry`] with a caller-supplied retry predicate.
    pub async fn retry_if<T, F, Fut, P>(&self, mut op: F, should_retry: P) -> AssayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AssayResult<T>>,
        P: Fn(&AssayError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !should_retry(&e) {
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                    let delay = self.delay_after(attempt);
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_computation() {
        let policy = RetryPolicy {
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(6), Duration::from_millis(16_000));
        assert_eq!(policy.delay_after(7), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_with_fractional_multiplier() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 1.5,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(150));
        assert_eq!(policy.delay_after(3), Duration::from_millis(225));
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable(&AssayError::Worker("channel closed".into())));
        assert!(is_retryable(&AssayError::Http("502 Bad Gateway".into())));
        assert!(is_retryable(&AssayError::Llm("timeout".into())));

        assert!(!is_retryable(&AssayError::CircuitOpen {
            dependency: "llm".into()
        }));
        assert!(!is_retryable(&AssayError::DispatchTimeout {
            scenario_id: uuid::Uuid::nil(),
            timeout_ms: 10
        }));
        assert!(!is_retryable(&AssayError::Config("bad".into())));
        assert!(!is_retryable(&AssayError::WorkerRejected("400 Bad Request".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        let start = tokio::time::Instant::now();

        let result = policy
            .retry(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(AssayError::Worker(format!("attempt {n} failed")))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 10,
            backoff_multiplier: 2.0,
        };
        let result: AssayResult<()> = policy
            .retry(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(AssayError::Http(format!("503 attempt {n}")))
            })
            .await;

        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("attempt 2"), "expected last error, got {msg}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn circuit_open_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: AssayResult<()> = policy
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AssayError::CircuitOpen {
                    dependency: "security-scan".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(AssayError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let result: AssayResult<()> = policy
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AssayError::Worker("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
