//! Requeue rate limiting
//!
//! Two limiters combined by taking the longer delay:
//! - per-key exponential backoff: `base * 2^failures`, capped at `max`
//! - overall token bucket: `qps` refill rate, `burst` capacity
//!
//! The per-key failure count doubles as the queue's requeue counter.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
pub(crate) fn safe_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Token bucket that hands out reservations instead of refusals
///
/// Every call takes a token, even when the bucket is empty; the returned
/// delay says how long the caller must wait for that token to exist.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (burst capacity)
    capacity: f64,
    /// Refill rate (tokens per second)
    refill_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// May go negative while reservations are outstanding
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(rate: f64, burst: u64) -> Self {
        let capacity = burst as f64;
        Self {
            capacity,
            refill_rate: rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Reserve one token and return how long to wait before using it
    pub fn reserve(&self) -> Duration {
        let mut state = safe_lock(&self.state);
        self.refill(&mut state);

        state.tokens -= 1.0;
        if state.tokens >= 0.0 || self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64(-state.tokens / self.refill_rate)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let tokens_to_add = elapsed.as_secs_f64() * self.refill_rate;

        if tokens_to_add > 0.0 {
            state.tokens = (state.tokens + tokens_to_add).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Current token count (negative while over-reserved)
    pub fn available_tokens(&self) -> f64 {
        let mut state = safe_lock(&self.state);
        self.refill(&mut state);
        state.tokens
    }
}

/// Per-key exponential backoff
#[derive(Debug)]
pub struct ItemBackoff {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return its backoff delay
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = safe_lock(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn failures(&self, key: &str) -> u32 {
        safe_lock(&self.failures).get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
        safe_lock(&self.failures).remove(key);
    }
}

/// Default requeue limiter: the longer of per-key backoff and the bucket
#[derive(Debug)]
pub struct RateLimiter {
    backoff: ItemBackoff,
    bucket: TokenBucket,
}

impl RateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration, qps: f64, burst: u64) -> Self {
        Self {
            backoff: ItemBackoff::new(base_delay, max_delay),
            bucket: TokenBucket::new(qps, burst),
        }
    }

    /// Delay before `key` may be retried; counts as one requeue
    pub fn when(&self, key: &str) -> Duration {
        let item_delay = self.backoff.next_delay(key);
        let bucket_delay = self.bucket.reserve();
        item_delay.max(bucket_delay)
    }

    /// Rate-limited requeues of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.backoff.failures(key)
    }

    /// Reset the requeue count of `key`
    pub fn forget(&self, key: &str) {
        self.backoff.forget(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000), 10.0, 100)
    }
}
