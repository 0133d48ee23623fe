//! Circuit breaker guarding one retrieval channel.
//!
//! The breaker counts consecutive failed fetches. Once the count reaches the
//! threshold it opens for a cool-down window; calls arriving during the window
//! are rejected without touching the network. After the window elapses the next
//! call goes through as a normal attempt (implicit half-open): a success closes
//! the breaker, a failure re-opens it with a fresh window.
//!
//! State lives only in process memory. A restarted process starts closed.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default circuit breaker configuration values.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_PAUSE_MS: u64 = 60_000;

/// Sentinel for "no open window".
const NOT_OPEN: u64 = 0;

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Number of consecutive failures before opening the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open, in milliseconds.
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_pause_ms() -> u64 {
    DEFAULT_PAUSE_MS
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            pause_ms: DEFAULT_PAUSE_MS,
        }
    }
}

impl CircuitConfig {
    /// Opens after `failure_threshold` consecutive failures and pauses for `pause`.
    pub fn new(failure_threshold: u32, pause: Duration) -> Self {
        Self {
            failure_threshold,
            pause_ms: pause.as_millis() as u64,
        }
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

/// The current state of the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until `until`.
    Open {
        /// When the cool-down ends.
        until: Instant,
    },
    /// The cool-down has elapsed; the next call is a trial attempt.
    HalfOpen,
}

/// Tracks consecutive failures for one channel and blocks calls while open.
///
/// # State Machine
///
/// ```text
/// CLOSED ──[failures >= threshold]──► OPEN (rejecting)
///   ▲                                   │
///   │                             [pause elapsed]
///   │                                   ▼
///   └────────[success]─────────── HALF-OPEN (trial)
///                                       │
///                                   [failure]
///                                       ▼
///                              OPEN (fresh pause)
/// ```
///
/// # Example
///
/// ```rust
/// use docstash_core::http::{CircuitBreaker, CircuitConfig};
///
/// let circuit = CircuitBreaker::new(CircuitConfig::default());
///
/// if circuit.can_execute() {
///     let success = true; // outcome of the request
///     if success {
///         circuit.record_success();
///     } else {
///         circuit.record_failure();
///     }
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Number of consecutive failures
    consecutive_failures: AtomicU32,
    /// Unix timestamp (ms) when the open window ends, or `NOT_OPEN`
    open_until_ms: AtomicU64,
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(NOT_OPEN),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitConfig::default())
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Check if a request may be sent now.
    ///
    /// Returns `false` only while the open window has not yet elapsed.
    pub fn can_execute(&self) -> bool {
        let open_until = self.open_until_ms.load(Ordering::SeqCst);
        open_until == NOT_OPEN || current_time_ms() >= open_until
    }

    /// Record a successful fetch. Closes the circuit and clears the failure count.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.open_until_ms.store(NOT_OPEN, Ordering::SeqCst);
    }

    /// Record a failed fetch.
    ///
    /// Opens the circuit once the consecutive failure count reaches the threshold.
    /// A failure during the trial attempt re-opens it with a fresh window.
    pub fn record_failure(&self) {
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);

        if failures >= self.config.failure_threshold {
            let until = current_time_ms().saturating_add(self.config.pause_ms).max(1);
            self.open_until_ms.store(until, Ordering::SeqCst);
            log::debug!(
                "circuit opened after {} consecutive failures for {}ms",
                failures,
                self.config.pause_ms
            );
        }
    }

    /// Get the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        match self.remaining_pause() {
            Some(remaining) => CircuitState::Open {
                until: Instant::now() + remaining,
            },
            None if self.open_until_ms.load(Ordering::SeqCst) != NOT_OPEN => {
                CircuitState::HalfOpen
            }
            None => CircuitState::Closed,
        }
    }

    /// True while calls are being rejected.
    pub fn is_open(&self) -> bool {
        !self.can_execute()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Wall-clock end of the current (or last) open window.
    pub fn open_until(&self) -> Option<SystemTime> {
        match self.open_until_ms.load(Ordering::SeqCst) {
            NOT_OPEN => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Time left before the next call is allowed, if the circuit is open.
    pub fn remaining_pause(&self) -> Option<Duration> {
        let open_until = self.open_until_ms.load(Ordering::SeqCst);
        if open_until == NOT_OPEN {
            return None;
        }
        let now = current_time_ms();
        (now < open_until).then(|| Duration::from_millis(open_until - now))
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.record_success();
    }
}

/// Get the current time in milliseconds since Unix epoch.
fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
