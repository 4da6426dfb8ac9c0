//! Retry policy for document store operations.
//!
//! Every store call made by the engine goes through [`RetryPolicy::execute`].
//! Only transient store errors (throttling, unavailability, timeouts) are
//! retried; everything else propagates on the first attempt. A nonpositive
//! attempt budget performs no attempts at all and reports that explicitly.

use crate::errors::{BrookError, Operation, StoreError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How long to wait between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffSchedule {
    /// Exponential growth from `base_delay`, capped at `max_delay`.
    Exponential {
        /// Delay before the first retry.
        base_delay: Duration,
        /// Upper bound of any single delay.
        max_delay: Duration,
        /// Growth factor per retry.
        multiplier: f64,
        /// Whether to randomize delays by +/-20% to avoid thundering herds.
        jitter: bool,
    },
    /// Explicit delays per retry; the last entry repeats.
    Fixed {
        /// Delay before retry `n` is `delays[n - 1]`.
        delays: Vec<Duration>,
    },
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffSchedule {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        match self {
            Self::Exponential {
                base_delay,
                max_delay,
                multiplier,
                jitter,
            } => {
                let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
                let scaled = base_delay.as_secs_f64() * multiplier.powi(exponent);
                let delay = Duration::try_from_secs_f64(scaled).unwrap_or(*max_delay);
                let capped = delay.min(*max_delay);
                if *jitter {
                    add_jitter(capped)
                } else {
                    capped
                }
            }
            Self::Fixed { delays } => {
                let index = usize::try_from(retry - 1).unwrap_or(usize::MAX);
                delays
                    .get(index)
                    .or_else(|| delays.last())
                    .copied()
                    .unwrap_or(Duration::ZERO)
            }
        }
    }
}

/// Add random jitter to prevent thundering herd effect
fn add_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let jitter_factor = rand::rng().random_range(0.8..1.2);
    delay.mul_f64(jitter_factor)
}

/// Retry strategy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategy {
    /// Maximum number of attempts, including the first. Nonpositive values
    /// mean no attempt is made.
    pub max_attempts: i32,
    /// Delay schedule between attempts.
    pub backoff: BackoffSchedule,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffSchedule::default(),
        }
    }
}

impl RetryStrategy {
    /// A strategy with the given budget and a deterministic exponential schedule.
    pub fn new(max_attempts: i32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffSchedule::Exponential {
                base_delay,
                max_delay: base_delay.saturating_mul(32),
                multiplier: 2.0,
                jitter: false,
            },
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffSchedule::Fixed { delays: Vec::new() },
        }
    }
}

/// Errors that can occur during retry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// The attempt budget was used up by transient failures.
    ExhaustedAttempts {
        /// Number of attempts made.
        attempts: u32,
        /// The last error encountered; `None` if no attempt was made.
        last_error: Option<StoreError>,
    },

    /// Non-retryable error encountered
    NonRetryable(StoreError),
}

impl RetryError {
    /// Attaches the operation name and converts into an engine error.
    pub fn into_brook_error(self, operation: Operation) -> BrookError {
        match self {
            Self::ExhaustedAttempts {
                attempts,
                last_error,
            } => BrookError::RetryExhausted {
                operation,
                attempts,
                last_error,
            },
            Self::NonRetryable(source) => BrookError::store(operation, source),
        }
    }
}

/// The single injectable retry point used by the repositories.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
}

impl RetryPolicy {
    /// Creates a policy from a strategy.
    pub const fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// The configured strategy.
    pub const fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Invokes `operation` until it succeeds, fails permanently, or the
    /// attempt budget runs out.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: Operation,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = u32::try_from(self.strategy.max_attempts).unwrap_or(0);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            operation = %operation_name,
                            attempt,
                            "[retry.run] operation succeeded after retries"
                        );
                    }
                    return Ok(result);
                }
                Err(error) if !error.is_transient() => {
                    return Err(RetryError::NonRetryable(error));
                }
                Err(error) => {
                    if attempt < max_attempts {
                        let scheduled = self.strategy.backoff.delay_for(attempt);
                        let delay = error
                            .retry_after()
                            .map_or(scheduled, |hint| hint.max(scheduled));
                        warn!(
                            operation = %operation_name,
                            attempt,
                            max_attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %error,
                            "[retry.run] transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        warn!(
            operation = %operation_name,
            attempts = max_attempts,
            "[retry.run] retry attempts exhausted"
        );
        Err(RetryError::ExhaustedAttempts {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Like [`run`](Self::run), mapping failures into [`BrookError`].
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: Operation,
        operation: F,
    ) -> Result<T, BrookError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run(operation_name, operation)
            .await
            .map_err(|error| error.into_brook_error(operation_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: i32) -> RetryPolicy {
        RetryPolicy::new(RetryStrategy::new(max_attempts, Duration::from_millis(1)))
    }

    #[test]
    fn exponential_delay_calculation() {
        let schedule = BackoffSchedule::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(schedule.delay_for(0), Duration::ZERO);
        assert_eq!(schedule.delay_for(1), Duration::from_millis(100));
        assert_eq!(schedule.delay_for(2), Duration::from_millis(200));
        assert_eq!(schedule.delay_for(3), Duration::from_millis(400));
        assert_eq!(schedule.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn fixed_schedule_repeats_last_entry() {
        let schedule = BackoffSchedule::Fixed {
            delays: vec![Duration::from_millis(10), Duration::from_millis(30)],
        };

        assert_eq!(schedule.delay_for(1), Duration::from_millis(10));
        assert_eq!(schedule.delay_for(2), Duration::from_millis(30));
        assert_eq!(schedule.delay_for(7), Duration::from_millis(30));
        let empty = BackoffSchedule::Fixed { delays: Vec::new() };
        assert_eq!(empty.delay_for(1), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let schedule = BackoffSchedule::Exponential {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        };

        for _ in 0..50 {
            let delay = schedule.delay_for(1);
            assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = Arc::clone(&counter);

        let result = fast(3)
            .run(Operation::ReadCursor, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn retries_throttling_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = Arc::clone(&counter);

        let result = fast(3)
            .run(Operation::ExecuteBatch, || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StoreError::Throttled {
                            retry_after: Some(Duration::from_millis(1)),
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(logs_contain("[retry.run] transient failure, backing off"));
        assert!(logs_contain("[retry.run] operation succeeded after retries"));
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_throttling() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = Arc::clone(&counter);

        let result = fast(2)
            .run(Operation::ExecuteBatch, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(StoreError::ServiceUnavailable("busy".into()))
                }
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::ExhaustedAttempts {
                attempts: 2,
                last_error: Some(StoreError::ServiceUnavailable("busy".into())),
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = Arc::clone(&counter);

        let result = fast(5)
            .run(Operation::CommitCursor, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(StoreError::PayloadTooLarge { size_bytes: 1 })
                }
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::NonRetryable(StoreError::PayloadTooLarge {
                size_bytes: 1
            }))
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nonpositive_budget_makes_zero_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = Arc::clone(&counter);

        let error = fast(-1)
            .execute(Operation::ExecuteBatch, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(
            error,
            BrookError::RetryExhausted {
                attempts: 0,
                last_error: None,
                ..
            }
        ));
        assert!(error.to_string().contains("0 attempt(s)"));
    }
}
