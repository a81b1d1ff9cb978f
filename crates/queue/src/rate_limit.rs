//! Per-key and overall rate limiters used for re-enqueueing failed keys.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long a key waits before it is re-added.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `key`. Records one more failure for it.
    fn when(&self, key: &K) -> Duration;
    /// Clear the failure history of `key`.
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Upper bound on any retry delay handed to the queue.
pub const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// `base * 2^failures`, capped at `max` (itself at most [`MAX_DELAY`]).
pub struct ItemExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K> ItemExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(MAX_DELAY);
        Self { base, max: max.min(MAX_DELAY).max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    /// Delay after `failures` previous failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures >= 64 { return self.max; }
        let nanos = match self.base.as_nanos().checked_mul(1u128 << failures) {
            Some(n) if n < self.max.as_nanos() => n,
            _ => return self.max,
        };
        Duration::new((nanos / 1_000_000_000) as u64, (nanos % 1_000_000_000) as u32)
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(key.clone()).or_insert(0);
        let prev = *n;
        *n = n.saturating_add(1);
        self.delay_for(prev)
    }

    fn forget(&self, key: &K) { lock(&self.failures).remove(key); }

    fn num_requeues(&self, key: &K) -> u32 { lock(&self.failures).get(key).copied().unwrap_or(0) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys: `qps` sustained, `burst` at once.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        if self.qps.is_nan() || self.qps <= 0.0 { return Duration::ZERO; }
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst);
        b.last = now;
        // Reserve a token even when it is not there yet; the debt is paid by waiting.
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-b.tokens / self.qps).map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Combines limiters: the longest delay wins, requeue count is the highest reported.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters { l.forget(key); }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Tunables for [`controller_rate_limiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(1000), qps: 10.0, burst: 100 }
    }
}

/// Per-key exponential backoff combined with an overall token bucket.
pub fn controller_rate_limiter<K>(cfg: RateLimitConfig) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(cfg.base_delay, cfg.max_delay)),
        Box::new(BucketRateLimiter::new(cfg.qps, cfg.burst)),
    ])
}

pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    controller_rate_limiter(RateLimitConfig::default())
}
