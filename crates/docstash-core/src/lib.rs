//! docstash-core - resilience primitives for rate-limited retrieval.
//!
//! Everything here is in-memory and free of filesystem or network I/O of its
//! own; the `docstash` crate wires these pieces around a real HTTP transport
//! and a disk cache.
//!
//! - [`http::CircuitBreaker`] - stops calling a failing channel for a cool-down window
//! - [`http::RetryPolicy`] / [`http::with_retry`] - exponential backoff over transient errors
//! - [`http::RateLimiter`] - minimum spacing between requests on a channel
//! - [`http::classify_status`] - retryable vs permanent status codes

pub mod http;
