//! Minimum-interval rate limiting for one channel.

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::time::Duration;

/// GCRA limiter with a burst of one cell.
type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Spaces requests on a channel at least `min_interval` apart.
///
/// Blocking: [`RateLimiter::acquire`] sleeps the calling thread until the
/// channel's quota admits another request.
pub struct RateLimiter {
    min_interval: Duration,
    /// `None` for a zero interval.
    limiter: Option<DirectLimiter>,
    clock: DefaultClock,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            limiter: Quota::with_period(min_interval).map(DirectLimiter::direct),
            clock: DefaultClock::default(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the quota admits a request and take it. Returns the time slept.
    pub fn acquire(&self) -> Duration {
        let Some(limiter) = &self.limiter else {
            return Duration::ZERO;
        };

        let mut slept = Duration::ZERO;
        while let Err(not_until) = limiter.check() {
            let wait = not_until.wait_time_from(self.clock.now());
            log::debug!("rate limiter sleeping {}ms", wait.as_millis());
            std::thread::sleep(wait);
            slept += wait;
        }
        slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_first_request_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        assert_eq!(limiter.acquire(), Duration::ZERO);
    }

    #[test]
    fn test_second_request_waits_out_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(40));
        limiter.acquire();

        let started = Instant::now();
        let slept = limiter.acquire();

        assert!(slept > Duration::ZERO);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_no_wait_after_interval_elapsed() {
        let limiter = RateLimiter::new(Duration::from_millis(5));
        limiter.acquire();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.acquire(), Duration::ZERO);
    }

    #[test]
    fn test_zero_interval_never_waits() {
        let limiter = RateLimiter::new(Duration::ZERO);
        assert_eq!(limiter.min_interval(), Duration::ZERO);
        limiter.acquire();
        assert_eq!(limiter.acquire(), Duration::ZERO);
    }

    #[test]
    fn test_three_requests_span_two_intervals() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire();
        }
        assert!(started.elapsed() >= Duration::from_millis(35));
    }
}
