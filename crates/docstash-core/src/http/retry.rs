//! Retry with exponential backoff.
//!
//! The retry policy is an explicit loop: run the attempt, classify the error,
//! sleep the backoff, try again. Nothing is hidden behind a wrapper type, so the
//! policy can be exercised directly in tests.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default retry configuration values.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_DELAY_MS: u64 = 16_000;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds. Doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) - randomizes delay by ±(factor * delay).
    #[serde(default)]
    pub jitter_factor: f32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries (single attempt only).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// Same shape as the default policy with millisecond-scale delays.
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter_factor: 0.0,
        }
    }

    /// Backoff after the attempt at `failed_index` (0-indexed) fails.
    ///
    /// `base * 2^failed_index`, clamped to `max_delay_ms`, then jittered.
    pub fn backoff_after(&self, failed_index: u32) -> Duration {
        let base_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << failed_index.min(32));
        let capped_ms = base_ms.min(self.max_delay_ms);

        let final_ms = if self.jitter_factor > 0.0 && capped_ms > 0 {
            let jitter_range = (capped_ms as f64 * self.jitter_factor as f64) as u64;
            let jitter = random_u64() % (jitter_range * 2 + 1);
            capped_ms
                .saturating_sub(jitter_range)
                .saturating_add(jitter)
                .min(self.max_delay_ms)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }

    /// Delay before attempt number `attempt` (0-indexed). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.backoff_after(attempt - 1)
        }
    }

    /// Delay after a failure. A server hint can lengthen the computed backoff
    /// but never shorten it; the result is clamped to `max_delay_ms`.
    pub fn delay_after(&self, failed_index: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.backoff_after(failed_index);
        match hint {
            Some(hint) => hint
                .max(backoff)
                .min(Duration::from_millis(self.max_delay_ms)),
            None => backoff,
        }
    }

    /// Attempt budget, never less than one.
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded.
    Success { value: T, attempts: u32 },
    /// Operation failed with a non-retryable error.
    Failure { error: E, attempts: u32 },
    /// All retry attempts exhausted.
    Exhausted {
        /// The last error encountered.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
        /// Total time spent sleeping between attempts.
        backoff: Duration,
    },
}

impl<T, E> RetryResult<T, E> {
    /// Convert to a standard Result, treating Exhausted as an error.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::Failure { error, .. } => Err(error),
            RetryResult::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success { .. })
    }

    /// Number of attempts made, whatever the outcome.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. }
            | RetryResult::Failure { attempts, .. }
            | RetryResult::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Trait for errors that can indicate whether a retry is appropriate.
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried.
    ///
    /// Retryable: 429, 500, 502, 503, 504, timeouts, DNS failures, refused or
    /// reset connections. Everything else is permanent.
    fn is_retryable(&self) -> bool;

    /// Server-specified delay before retrying, typically from `Retry-After`.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Execute an operation with automatic retry on failure.
///
/// `operation` receives the 0-indexed attempt number. Non-retryable errors are
/// returned immediately without consuming further budget.
///
/// ```rust
/// use docstash_core::http::{with_retry, RetryPolicy, RetryResult, RetryableError};
///
/// #[derive(Debug)]
/// struct Flaky;
/// impl RetryableError for Flaky {
///     fn is_retryable(&self) -> bool { true }
/// }
///
/// let result = with_retry(&RetryPolicy::fast(3), |attempt| {
///     if attempt < 2 { Err(Flaky) } else { Ok("done") }
/// });
/// assert!(matches!(result, RetryResult::Success { attempts: 3, .. }));
/// ```
pub fn with_retry<T, E, F>(policy: &RetryPolicy, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    E: RetryableError,
{
    let budget = policy.attempt_budget();
    let mut backoff = Duration::ZERO;
    let mut attempt = 0;

    loop {
        let err = match operation(attempt) {
            Ok(value) => {
                return RetryResult::Success {
                    value,
                    attempts: attempt + 1,
                }
            }
            Err(err) => err,
        };

        let attempts = attempt + 1;
        if !err.is_retryable() {
            return RetryResult::Failure {
                error: err,
                attempts,
            };
        }
        if attempts >= budget {
            return RetryResult::Exhausted {
                last_error: err,
                attempts,
                backoff,
            };
        }

        let delay = policy.delay_after(attempt, err.retry_after());
        log::debug!(
            "attempt {}/{} failed, retrying in {}ms",
            attempts,
            budget,
            delay.as_millis()
        );
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        backoff += delay;
        attempt += 1;
    }
}

/// Simple pseudo-random number generator for jitter.
/// Xorshift, not cryptographically secure.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64 | 1)
                .unwrap_or(0x2545_f491_4f6c_dd1d)
        );
    }

    STATE.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
        retry_after: Option<Duration>,
    }

    impl TestError {
        fn transient() -> Self {
            Self {
                retryable: true,
                retry_after: None,
            }
        }
    }

    impl RetryableError for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }

        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 16_000);
        assert_eq!(policy.jitter_factor, 0.0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_after(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_after(4), Duration::from_secs(16));
        assert_eq!(policy.backoff_after(5), Duration::from_secs(16));
        assert_eq!(policy.backoff_after(63), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_server_hint_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_after(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            policy.delay_after(0, Some(Duration::from_secs(120))),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn test_server_hint_never_shortens_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(2, Some(Duration::ZERO)), Duration::from_secs(4));
        assert_eq!(
            policy.delay_after(3, Some(Duration::from_secs(2))),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn test_retry_zero_hint_keeps_exponential_spacing() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 5,
            max_delay_ms: 40,
            jitter_factor: 0.0,
        };

        let started = std::time::Instant::now();
        let result: RetryResult<(), TestError> = with_retry(&policy, |_| {
            Err(TestError {
                retryable: true,
                retry_after: Some(Duration::ZERO),
            })
        });

        match result {
            RetryResult::Exhausted {
                attempts, backoff, ..
            } => {
                assert_eq!(attempts, 4);
                // 5ms + 10ms + 20ms
                assert_eq!(backoff, Duration::from_millis(35));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(35));
    }

    #[test]
    fn test_retry_success_first_attempt() {
        let mut call_count = 0;

        let result: RetryResult<&str, TestError> = with_retry(&RetryPolicy::no_retry(), |_| {
            call_count += 1;
            Ok("success")
        });

        assert!(result.is_success());
        assert_eq!(result.attempts(), 1);
        assert_eq!(call_count, 1);
    }

    #[test]
    fn test_retry_success_after_failures() {
        let mut seen = Vec::new();

        let result: RetryResult<&str, TestError> = with_retry(&RetryPolicy::fast(5), |attempt| {
            seen.push(attempt);
            if attempt < 2 {
                Err(TestError::transient())
            } else {
                Ok("success")
            }
        });

        assert!(matches!(result, RetryResult::Success { attempts: 3, .. }));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_retry_non_retryable_error() {
        let mut call_count = 0;

        let result: RetryResult<&str, TestError> = with_retry(&RetryPolicy::default(), |_| {
            call_count += 1;
            Err(TestError {
                retryable: false,
                retry_after: None,
            })
        });

        assert!(matches!(result, RetryResult::Failure { attempts: 1, .. }));
        assert_eq!(call_count, 1);
    }

    #[test]
    fn test_retry_exhausted_reports_backoff() {
        let mut call_count = 0;

        let result: RetryResult<&str, TestError> = with_retry(&RetryPolicy::fast(4), |_| {
            call_count += 1;
            Err(TestError::transient())
        });

        match result {
            RetryResult::Exhausted {
                attempts, backoff, ..
            } => {
                assert_eq!(attempts, 4);
                // 1ms + 2ms + 4ms between four attempts
                assert_eq!(backoff, Duration::from_millis(7));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(call_count, 4);
    }

    #[test]
    fn test_retry_uses_server_hint() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 50,
            jitter_factor: 0.0,
        };

        let result: RetryResult<(), TestError> = with_retry(&policy, |_| {
            Err(TestError {
                retryable: true,
                retry_after: Some(Duration::from_millis(30)),
            })
        });

        assert!(matches!(
            result,
            RetryResult::Exhausted { backoff, .. } if backoff == Duration::from_millis(30)
        ));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::fast(0)
        };
        let mut call_count = 0;

        let result: RetryResult<(), TestError> = with_retry(&policy, |_| {
            call_count += 1;
            Err(TestError::transient())
        });

        assert!(matches!(result, RetryResult::Exhausted { attempts: 1, .. }));
        assert_eq!(call_count, 1);
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..RetryPolicy::default()
        };

        for _ in 0..50 {
            let delay = policy.backoff_after(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
        assert!(policy.backoff_after(10) <= Duration::from_secs(16));
    }
}
