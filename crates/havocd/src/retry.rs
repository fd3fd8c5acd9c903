//! Optimistic-concurrency retry: re-run a read-modify-write closure while the
//! store reports a version conflict.

use std::time::Duration;

use havoc_core::config::RetryConfig;
use tracing::debug;

use crate::client::StoreError;

/// Exponential backoff without jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub steps: u32,
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Backoff {
    /// Five attempts, 10ms apart.
    pub fn default_retry() -> Self {
        Self {
            steps: 5,
            initial: Duration::from_millis(10),
            factor: 1.0,
            max: Duration::from_millis(1000),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            steps: config.steps.max(1),
            initial: Duration::from_millis(config.initial_backoff_ms),
            factor: if config.factor < 1.0 { 1.0 } else { config.factor },
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Sleep before attempt `attempt + 1` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_nanos() as f64 * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.max.as_nanos() as f64).max(0.0);
        Duration::from_nanos(capped.round() as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::default_retry()
    }
}

/// Run `attempt` until it succeeds, fails with something other than a
/// conflict, or the backoff runs out of steps. The last conflict is returned
/// on exhaustion.
pub async fn retry_on_conflict<T, F>(backoff: Backoff, mut attempt: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let steps = backoff.steps.max(1);
    let mut tries = 0;
    loop {
        match attempt() {
            Err(err) if err.is_conflict() && tries + 1 < steps => {
                let delay = backoff.delay(tries);
                debug!(attempt = tries + 1, delay_ms = delay.as_millis() as u64, error = %err, "write conflict, retrying");
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_core::types::{ObjectKey, ObjectKind};

    fn conflict() -> StoreError {
        StoreError::Conflict {
            kind: ObjectKind::Experiment,
            key: ObjectKey::new("default", "delay"),
            expected: 1,
            actual: 2,
        }
    }

    fn fast(steps: u32) -> Backoff {
        Backoff {
            steps,
            initial: Duration::from_millis(1),
            factor: 1.0,
            max: Duration::from_millis(1),
        }
    }

    #[test]
    fn delay_grows_by_factor_and_caps() {
        let backoff = Backoff {
            steps: 5,
            initial: Duration::from_millis(10),
            factor: 2.0,
            max: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(20));
        assert_eq!(backoff.delay(2), Duration::from_millis(40));
        assert_eq!(backoff.delay(3), Duration::from_millis(50));
    }

    #[test]
    fn from_config_clamps_degenerate_values() {
        let backoff = Backoff::from_config(&RetryConfig {
            steps: 0,
            initial_backoff_ms: 5,
            factor: 0.5,
            max_backoff_ms: 100,
        });
        assert_eq!(backoff.steps, 1);
        assert_eq!(backoff.factor, 1.0);
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let mut calls = 0;
        let result = retry_on_conflict(fast(5), || {
            calls += 1;
            if calls < 3 {
                Err(conflict())
            } else {
                Ok(calls)
            }
        })
        .await
        .expect("eventually succeeds");
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_the_conflict() {
        let mut calls = 0;
        let err = retry_on_conflict(fast(3), || -> Result<(), StoreError> {
            calls += 1;
            Err(conflict())
        })
        .await
        .expect_err("never succeeds");
        assert!(err.is_conflict());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_on_conflict(fast(5), || -> Result<(), StoreError> {
            calls += 1;
            Err(StoreError::LockPoisoned)
        })
        .await
        .expect_err("fails immediately");
        assert!(matches!(err, StoreError::LockPoisoned));
        assert_eq!(calls, 1);
    }
}
