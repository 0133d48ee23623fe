//! HTTP resilience utilities.
//!
//! This module provides the pieces a fetcher composes around each outbound
//! request: a per-channel [`RateLimiter`], a [`CircuitBreaker`], and
//! [`with_retry`] driven by a [`RetryPolicy`].
//!
//! ## Retry Policy
//!
//! ```rust,ignore
//! use docstash_core::http::{with_retry, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let result = with_retry(&policy, |attempt| {
//!     // Your HTTP operation here
//!     Ok::<_, MyError>("success")
//! });
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust,ignore
//! use docstash_core::http::{CircuitBreaker, CircuitConfig};
//!
//! let circuit = CircuitBreaker::new(CircuitConfig::default());
//!
//! if circuit.can_execute() {
//!     match make_request() {
//!         Ok(_) => circuit.record_success(),
//!         Err(_) => circuit.record_failure(),
//!     }
//! }
//! ```

mod circuit_breaker;
mod rate_limit;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
pub use rate_limit::RateLimiter;
pub use retry::{with_retry, RetryPolicy, RetryResult, RetryableError};

/// Status codes worth retrying.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// How a response status should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx.
    Success,
    /// Transient; retry with backoff.
    Retryable,
    /// Permanent; do not spend retry budget on it.
    Permanent,
}

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        s if RETRYABLE_STATUS_CODES.contains(&s) => StatusClass::Retryable,
        _ => StatusClass::Permanent,
    }
}
