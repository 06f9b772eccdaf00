//! The four named retry policies and the retry executor.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::classify::{classify, ErrorCategory};

/// Backoff-and-classification policy applied to activities and outbound
/// calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Policy name, for logs.
    pub name: &'static str,
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Backoff ceiling.
    pub max_interval: Duration,
    /// Categories this policy refuses to retry beyond the universally
    /// non-retryable ones.
    pub non_retryable: &'static [ErrorCategory],
}

impl RetryPolicy {
    /// 3 attempts, 1s initial, 2x backoff capped at 1 min. Non-retryable:
    /// validation, not_found.
    pub fn standard() -> Self {
        Self {
            name: "standard",
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            non_retryable: &[ErrorCategory::Validation, ErrorCategory::NotFound],
        }
    }

    /// 5 attempts, 0.5s initial, 2x backoff capped at 30s. Non-retryable:
    /// validation, not_found, conflict. Used by compensations.
    pub fn aggressive() -> Self {
        Self {
            name: "aggressive",
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            non_retryable: &[
                ErrorCategory::Validation,
                ErrorCategory::NotFound,
                ErrorCategory::Conflict,
            ],
        }
    }

    /// 2 attempts, 2s initial, 2x backoff capped at 2 min. Non-retryable:
    /// validation, not_found.
    pub fn conservative() -> Self {
        Self {
            name: "conservative",
            max_attempts: 2,
            initial_interval: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            non_retryable: &[ErrorCategory::Validation, ErrorCategory::NotFound],
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            name: "none",
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_interval: Duration::ZERO,
            non_retryable: &[],
        }
    }

    /// Whether the policy retries errors of `category`.
    pub fn retries(&self, category: ErrorCategory) -> bool {
        category.is_retryable() && !self.non_retryable.contains(&category)
    }

    /// Backoff before retry number `retry` (1-based), with ±10% jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Run `op` under `policy`, classifying each failure before deciding to
/// retry. Returns the final error once attempts are exhausted or the error
/// is non-retryable for this policy.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let category = classify(&err);
                if !policy.retries(category) {
                    debug!(
                        policy = policy.name,
                        ?category,
                        attempt,
                        "error is non-retryable, giving up"
                    );
                    return Err(err);
                }
                if attempt >= policy.max_attempts {
                    warn!(
                        policy = policy.name,
                        ?category,
                        attempts = attempt,
                        "retries exhausted"
                    );
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(
                    policy = policy.name,
                    ?category,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wharf_types::WmsError;

    #[test]
    fn policy_tables_match_contract() {
        let standard = RetryPolicy::standard();
        assert_eq!(standard.max_attempts, 3);
        assert_eq!(standard.initial_interval, Duration::from_secs(1));
        assert!(!standard.retries(ErrorCategory::Validation));
        assert!(!standard.retries(ErrorCategory::NotFound));
        assert!(standard.retries(ErrorCategory::Conflict));
        assert!(standard.retries(ErrorCategory::Timeout));

        let aggressive = RetryPolicy::aggressive();
        assert_eq!(aggressive.max_attempts, 5);
        assert!(!aggressive.retries(ErrorCategory::Conflict));

        let none = RetryPolicy::none();
        assert_eq!(none.max_attempts, 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            name: "test",
            max_attempts: 10,
            initial_interval: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(4),
            non_retryable: &[],
        };
        // Jitter is ±10%, so assert against the bounds.
        let d1 = policy.delay_for(1).as_secs_f64();
        assert!((0.9..=1.1).contains(&d1), "first retry delay {d1}");
        let d2 = policy.delay_for(2).as_secs_f64();
        assert!((1.8..=2.2).contains(&d2), "second retry delay {d2}");
        let d5 = policy.delay_for(5).as_secs_f64();
        assert!(d5 <= 4.4, "capped delay {d5}");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<u32> = retry(&RetryPolicy::standard(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(anyhow::anyhow!("connection refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry(&RetryPolicy::standard(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::Error::new(WmsError::validation("bad"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry(&RetryPolicy::aggressive(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("timed out")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_not_retried_by_aggressive() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry(&RetryPolicy::aggressive(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::Error::new(WmsError::conflict("already reserved"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
