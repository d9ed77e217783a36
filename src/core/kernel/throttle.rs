use governor::clock::{Clock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::ops::Add;
use std::time::Duration;
use tokio::time::Instant;

/// `governor` clock reading tokio's time source.
///
/// Throttling then follows the same clock as heartbeats and backoff, including
/// when tokio time is paused.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokioInstant(Instant);

impl Add<Nanos> for TokioInstant {
    type Output = Self;

    fn add(self, other: Nanos) -> Self {
        Self(self.0 + Duration::from(other))
    }
}

impl Reference for TokioInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        Nanos::from(self.0.saturating_duration_since(earlier.0))
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        self.0
            .checked_sub(Duration::from(duration))
            .map_or(*self, Self)
    }
}

impl Clock for TokioClock {
    type Instant = TokioInstant;

    fn now(&self) -> TokioInstant {
        TokioInstant(Instant::now())
    }
}

type Limiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<TokioInstant>>;

/// Outbound frame rate limit for one socket.
pub struct FrameThrottle {
    limiter: Limiter,
    clock: TokioClock,
}

impl std::fmt::Debug for FrameThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameThrottle").finish_non_exhaustive()
    }
}

impl FrameThrottle {
    pub fn per_second(frames: NonZeroU32) -> Self {
        let clock = TokioClock;
        Self {
            limiter: RateLimiter::direct_with_clock(Quota::per_second(frames), &clock),
            clock,
        }
    }

    /// Wait until one more frame may be sent.
    pub async fn ready(&self) {
        while let Err(not_until) = self.limiter.check() {
            tokio::time::sleep(not_until.wait_time_from(self.clock.now())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero_ext::nonzero;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_waits_on_tokio_time() {
        let throttle = FrameThrottle::per_second(nonzero!(5u32));
        let start = Instant::now();

        for _ in 0..5 {
            throttle.ready().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        throttle.ready().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(200), "{:?}", waited);
        assert!(waited < Duration::from_millis(400), "{:?}", waited);
    }
}
