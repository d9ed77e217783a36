use crate::core::config::BucketConfig;
use crate::core::errors::ExchangeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Token bucket with discrete refills: `refill_amount` tokens every `interval`.
///
/// Tokens may go negative. A negative balance is debt owed by callers already
/// sleeping, so later callers queue behind them.
#[derive(Debug)]
struct Bucket {
    capacity: i64,
    refill_amount: i64,
    interval: Duration,
    tokens: i64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: &BucketConfig, now: Instant) -> Self {
        Self {
            capacity: i64::from(config.capacity.max(1)),
            refill_amount: i64::from(config.refill_amount.max(1)),
            interval: config.refill_interval().max(Duration::from_millis(1)),
            tokens: i64::from(config.capacity.max(1)),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.tokens >= self.capacity {
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = (elapsed.as_nanos() / self.interval.as_nanos()) as i64;
        if intervals == 0 {
            return;
        }
        self.tokens = self.tokens.saturating_add(intervals.saturating_mul(self.refill_amount));
        if self.tokens >= self.capacity {
            self.tokens = self.capacity;
            self.last_refill = now;
        } else {
            // Bounded by capacity / refill_amount here, so the cast cannot overflow.
            self.last_refill += self.interval * intervals as u32;
        }
    }

    /// Time until a balance of `tokens` is non-negative.
    fn wait_for_balance(&self, tokens: i64, now: Instant) -> Duration {
        if tokens >= 0 {
            return Duration::ZERO;
        }
        let deficit = -tokens;
        let refills = (deficit + self.refill_amount - 1) / self.refill_amount;
        let ready_at = self.last_refill + self.interval * refills as u32;
        ready_at.saturating_duration_since(now)
    }

    fn refund(&mut self, weight: i64) {
        self.tokens = (self.tokens + weight).min(self.capacity);
    }
}

struct LimiterInner {
    name: String,
    buckets: Mutex<HashMap<String, Bucket>>,
    shutdown: watch::Sender<bool>,
}

/// Weighted token-bucket limiter keyed by endpoint class.
///
/// One instance per exchange account; all buckets share one lock so instances never contend.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("classes", &self.inner.buckets.lock().len())
            .finish()
    }
}

/// Refunds a reservation if the waiting caller is cancelled.
struct Reservation<'a> {
    limiter: &'a LimiterInner,
    charges: Vec<(&'a str, i64)>,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut buckets = self.limiter.buckets.lock();
            for (class, weight) in &self.charges {
                if let Some(bucket) = buckets.get_mut(*class) {
                    bucket.refund(*weight);
                }
            }
            trace!(limiter = %self.limiter.name, charges = ?self.charges, "refunded cancelled reservation");
        }
    }
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, buckets: &[BucketConfig]) -> Self {
        let now = Instant::now();
        let map = buckets
            .iter()
            .map(|cfg| (cfg.class.clone(), Bucket::new(cfg, now)))
            .collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(LimiterInner {
                name: name.into(),
                buckets: Mutex::new(map),
                shutdown,
            }),
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.inner.buckets.lock().contains_key(class)
    }

    /// Current balance of a class, negative while callers are waiting.
    pub fn available(&self, class: &str) -> Option<i64> {
        let mut buckets = self.inner.buckets.lock();
        let bucket = buckets.get_mut(class)?;
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Wake every waiter with `Shutdown` and refuse new acquisitions.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Acquire `weight` tokens from `class`, suspending until they are available.
    ///
    /// Fails fast with `RateLimitTimeout` when the wait would exceed `timeout`; in that
    /// case no tokens are taken. Classes without a bucket are not limited.
    pub async fn acquire(
        &self,
        class: &str,
        weight: u32,
        timeout: Option<Duration>,
    ) -> Result<(), ExchangeError> {
        self.acquire_all(&[(class, weight)], timeout).await
    }

    /// Acquire from several classes at once, for endpoints that count against more
    /// than one limit.
    ///
    /// All charges are taken together or none is: the wait is that of the slowest
    /// bucket, and a timeout leaves every bucket untouched.
    #[instrument(skip(self), fields(limiter = %self.inner.name))]
    pub async fn acquire_all(
        &self,
        charges: &[(&str, u32)],
        timeout: Option<Duration>,
    ) -> Result<(), ExchangeError> {
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(ExchangeError::Shutdown);
        }

        let (wait, taken) = {
            let mut buckets = self.inner.buckets.lock();
            let now = Instant::now();
            let mut wait = Duration::ZERO;
            let mut slowest = None;
            let mut taken = Vec::with_capacity(charges.len());

            for &(class, weight) in charges {
                let weight = i64::from(weight.max(1));
                let Some(bucket) = buckets.get_mut(class) else {
                    trace!(class, "no bucket configured, not limited");
                    continue;
                };
                if weight > bucket.capacity {
                    return Err(ExchangeError::InvalidParameters(format!(
                        "weight {} exceeds capacity {} of class {}",
                        weight, bucket.capacity, class
                    )));
                }
                bucket.refill(now);
                let bucket_wait = bucket.wait_for_balance(bucket.tokens - weight, now);
                if slowest.is_none() || bucket_wait > wait {
                    wait = bucket_wait;
                    slowest = Some(class);
                }
                taken.push((class, weight));
            }

            if let Some(class) = slowest {
                if timeout.is_some_and(|limit| wait > limit) {
                    debug!(class, wait_ms = wait.as_millis() as u64, "rate limit wait exceeds timeout");
                    return Err(ExchangeError::RateLimitTimeout(class.to_string()));
                }
            }
            for (class, weight) in &taken {
                if let Some(bucket) = buckets.get_mut(*class) {
                    bucket.tokens -= *weight;
                }
            }
            (wait, taken)
        };

        if wait.is_zero() {
            return Ok(());
        }

        debug!(charges = ?taken, wait_ms = wait.as_millis() as u64, "waiting for rate limit");
        let mut reservation = Reservation {
            limiter: &self.inner,
            charges: taken,
            armed: true,
        };

        tokio::select! {
            () = tokio::time::sleep(wait) => {
                reservation.armed = false;
                Ok(())
            }
            _ = shutdown_rx.changed() => Err(ExchangeError::Shutdown),
        }
    }
}
