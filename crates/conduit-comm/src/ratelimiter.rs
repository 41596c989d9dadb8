use std::num::NonZeroU32;
use std::sync::Arc;

use conduit_timing::{Clock, OurClockForNanos};
use governor::{Quota, RateLimiter as GovernorRateLimiter};

/// Token-bucket traffic shaper consulted by a processor on each read and
/// write. Token buckets are internally synchronised (governor's state is a
/// lock-free counter), so one limiter may be shared across many reader
/// threads without external locking.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<GovernorRateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, OurClockForNanos>>>,
}

impl RateLimiter {
    /// A limiter that never throttles. The global singleton for this case
    /// is constructed once per reactor and never mutated, matching every
    /// other no-op policy in this crate.
    #[must_use]
    pub fn no_limit() -> Self {
        Self { inner: None }
    }

    /// A token bucket sustaining `bytes_per_sec` with a burst allowance of
    /// `burst_bytes`.
    #[must_use]
    pub fn bytes_per_sec(bytes_per_sec: u32, burst_bytes: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(bytes_per_sec).expect("bytes_per_sec must be > 0"))
            .allow_burst(NonZeroU32::new(burst_bytes.max(1)).expect("burst_bytes must be > 0"));
        let clock = OurClockForNanos::Clock(Clock::new());
        let limiter = GovernorRateLimiter::direct_with_clock(quota, &clock);
        Self { inner: Some(Arc::new(limiter)) }
    }

    /// Notifies the limiter that `bytes` were read or written, blocking the
    /// calling thread until the token bucket has capacity for them. This is
    /// the only place an application thread parks on rate limiting; reactor
    /// threads must never call this with a limiter that can block for long,
    /// since it would stall every other connection on that selector.
    pub fn consume(&self, bytes: u32) {
        let Some(limiter) = self.inner.as_ref() else { return };
        let Some(cells) = NonZeroU32::new(bytes) else { return };
        loop {
            match limiter.check_n(cells) {
                Ok(Ok(())) => return,
                Ok(Err(not_until)) => {
                    let wait = not_until.wait_time_from(limiter.clock().now());
                    std::thread::sleep(wait);
                }
                Err(_insufficient_capacity) => {
                    // The burst itself is smaller than this single call; let
                    // it through rather than block forever on an impossible
                    // request.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn no_limit_never_blocks() {
        let limiter = RateLimiter::no_limit();
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.consume(64 * 1024);
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[test]
    fn bucket_throttles_sustained_throughput() {
        let limiter = RateLimiter::bytes_per_sec(1_000_000, 100_000);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.consume(100_000);
        }
        assert!(start.elapsed() >= std::time::Duration::from_millis(800));
    }
}
