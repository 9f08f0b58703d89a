//! Bounded exponential backoff for backend calls.
//!
//! HTTP 429 / 503 and "model overloaded" answers are routine under
//! concurrent load. A call is attempted at most `max_attempts` times; the
//! wait before attempt `n + 1` is `base_delay × multiplier^(n - 1)`, so the
//! default policy sleeps 2 s, then 4 s, and then gives up. Fatal errors
//! (bad key, malformed request) return immediately.
//!
//! Sleeping goes through the [`Sleeper`] trait so tests can record the
//! delays instead of waiting for them.

use crate::error::BackendError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Something that can wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real time via `tokio::time::sleep`. Dropping the future cancels the wait.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry schedule.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts including the first. Minimum 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            multiplier: 2.0,
        }
    }
}

/// Outcome of a retried call: the final result plus how many attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, BackendError>,
    pub attempts: u32,
}

impl BackoffPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` failed (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor.max(0.0))
    }

    /// Whether a failure is worth another attempt.
    pub fn is_retryable(&self, err: &BackendError) -> bool {
        err.is_transient()
    }

    /// Run `call` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `on_attempt` sees every failed attempt (1-based) so callers can keep
    /// an audit trail.
    pub async fn run<T, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        label: &str,
        mut call: F,
        mut on_attempt: impl FnMut(u32, &Result<T, BackendError>),
    ) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = call().await;
            on_attempt(attempt, &result);

            match &result {
                Err(e) if self.is_retryable(e) && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        label, attempt, max_attempts, e, delay
                    );
                    sleeper.sleep(delay).await;
                }
                _ => {
                    return Retried {
                        result,
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records requested delays without waiting.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[tokio::test]
    async fn transient_failures_sleep_two_then_four_seconds() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::default();

        let out: Retried<()> = policy
            .run(
                &sleeper,
                "test",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(BackendError::from_status("gemini", 503, "overloaded")) }
                },
                |_, _| {},
            )
            .await;

        assert!(out.result.is_err());
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "no fourth attempt");
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let sleeper = RecordingSleeper::default();
        let out: Retried<()> = BackoffPolicy::default()
            .run(
                &sleeper,
                "test",
                || async { Err(BackendError::from_status("openai", 401, "bad key")) },
                |_, _| {},
            )
            .await;
        assert_eq!(out.attempts, 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_after_one_retry() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let mut seen = Vec::new();
        let out = BackoffPolicy::default()
            .run(
                &sleeper,
                "test",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(BackendError::from_status("groq", 429, "rate_limit_exceeded"))
                        } else {
                            Ok("json")
                        }
                    }
                },
                |attempt, result| seen.push((attempt, result.is_ok())),
            )
            .await;
        assert_eq!(out.result.unwrap(), "json");
        assert_eq!(out.attempts, 2);
        assert_eq!(seen, vec![(1, false), (2, true)]);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_secs(2)]);
    }

    #[test]
    fn delay_schedule() {
        let p = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 3.0,
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(500));
        assert_eq!(p.delay_after(2), Duration::from_millis(1500));
        assert_eq!(p.delay_after(3), Duration::from_millis(4500));
    }
}
