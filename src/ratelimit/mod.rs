//! Sharded in-memory token-bucket rate limiter.
//!
//! The bucket space is split over [`SHARD_COUNT`] independently locked shards.
//! Each shard keeps its buckets in an [`LruMap`] so that a full shard can evict
//! its least recently used bucket in O(1), and so the sweeper can stop at the
//! first bucket that is still fresh.

pub mod key;
pub mod lru;
pub mod middleware;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::services::worker::BackgroundWorker;
use key::{fnv1a_32, policy_suffix};
use lru::LruMap;

pub use key::ProxyTrust;
pub use middleware::{RateLimitGuard, rate_limit};

pub const SHARD_COUNT: usize = 256;
pub const MAX_BUCKETS: usize = 1_000_000;
pub const MAX_BUCKETS_PER_SHARD: usize = MAX_BUCKETS / SHARD_COUNT;
pub const CLEANUP_BATCH_SIZE: usize = 1000;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const BUCKET_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Reset/retry hint when a policy never refills.
const NO_REFILL_RESET_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u32,
    pub burst: u32,
    /// Give the token back when the handler answers with a 4xx/5xx.
    #[serde(default)]
    pub skip_failed: bool,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            requests_per_minute,
            burst,
            skip_failed: false,
        }
    }

    #[must_use]
    pub const fn skipping_failed(mut self) -> Self {
        self.skip_failed = true;
        self
    }

    /// Tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    #[must_use]
    pub fn key_suffix(&self) -> String {
        policy_suffix(self.requests_per_minute, self.burst)
    }
}

/// Outcome of a single admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u64,
    pub reset_seconds: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl Bucket {
    fn new(policy: &RateLimitPolicy, now: Instant) -> Self {
        let burst = f64::from(policy.burst);
        Self {
            tokens: burst,
            max_tokens: burst,
            refill_rate: policy.refill_rate(),
            last_refill: now,
            last_access: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed > Duration::ZERO && self.refill_rate > 0.0 {
            self.tokens = elapsed
                .as_secs_f64()
                .mul_add(self.refill_rate, self.tokens)
                .min(self.max_tokens);
            self.last_refill = now;
        }
    }

    fn take(&mut self, now: Instant, limit: u32) -> Decision {
        self.refill(now);
        if now > self.last_access {
            self.last_access = now;
        }

        let allowed = self.tokens >= 1.0;
        let reset_seconds = if allowed {
            self.tokens -= 1.0;
            if self.refill_rate > 0.0 {
                ceil_secs((self.max_tokens - self.tokens) / self.refill_rate)
            } else if self.tokens >= self.max_tokens {
                0
            } else {
                NO_REFILL_RESET_SECS
            }
        } else if self.refill_rate > 0.0 {
            ceil_secs(1.0 / self.refill_rate)
        } else {
            NO_REFILL_RESET_SECS
        };

        Decision {
            allowed,
            limit,
            remaining: floor_tokens(self.tokens),
            reset_seconds,
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ceil_secs(value: f64) -> u64 {
    value.max(0.0).ceil() as u64
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn floor_tokens(value: f64) -> u64 {
    value.max(0.0).floor() as u64
}

pub struct RateLimiter {
    shards: Box<[Mutex<LruMap<Bucket>>]>,
    max_buckets_per_shard: usize,
    bucket_expiry: Duration,
    sweeper: BackgroundWorker,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(MAX_BUCKETS_PER_SHARD, BUCKET_EXPIRY)
    }

    #[must_use]
    pub fn with_limits(max_buckets_per_shard: usize, bucket_expiry: Duration) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            max_buckets_per_shard: max_buckets_per_shard.max(1),
            bucket_expiry,
            sweeper: BackgroundWorker::new("rate_limit_sweeper", SWEEP_INTERVAL),
        }
    }

    #[must_use]
    pub fn shard_index(key: &str) -> usize {
        fnv1a_32(key.as_bytes()) as usize % SHARD_COUNT
    }

    fn shard(&self, index: usize) -> MutexGuard<'_, LruMap<Bucket>> {
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn admit(&self, key: &str, policy: &RateLimitPolicy) -> Decision {
        self.admit_at(key, policy, Instant::now())
    }

    pub fn admit_at(&self, key: &str, policy: &RateLimitPolicy, now: Instant) -> Decision {
        let limit = policy.requests_per_minute;
        let mut shard = self.shard(Self::shard_index(key));

        if let Some(bucket) = shard.get_mut_touch(key) {
            return bucket.take(now, limit);
        }

        if shard.len() >= self.max_buckets_per_shard
            && let Some((evicted, _)) = shard.pop_tail()
        {
            metrics::counter!("rate_limit_evictions_total").increment(1);
            debug!(key = %evicted, "Evicted least recently used rate bucket");
        }

        let mut bucket = Bucket::new(policy, now);
        let decision = bucket.take(now, limit);
        shard.push_front(key.to_string(), bucket);
        decision
    }

    /// Return one token to `key`. No-op if the bucket is gone.
    pub fn refund(&self, key: &str) {
        let mut shard = self.shard(Self::shard_index(key));
        if let Some(bucket) = shard.peek_mut(key) {
            bucket.tokens = (bucket.tokens + 1.0).min(bucket.max_tokens);
        }
    }

    /// Drop idle buckets, walking each shard from its LRU tail.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for index in 0..SHARD_COUNT {
            let mut shard = self.shard(index);
            let mut removed_here = 0;
            while removed_here < CLEANUP_BATCH_SIZE {
                let expired = shard.peek_tail().is_some_and(|(_, bucket)| {
                    now.saturating_duration_since(bucket.last_access) > self.bucket_expiry
                });
                if !expired {
                    break;
                }
                shard.pop_tail();
                removed_here += 1;
            }
            removed += removed_here;
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.shard(Self::shard_index(key)).contains(key)
    }

    #[must_use]
    pub fn shard_len(&self, index: usize) -> usize {
        self.shard(index).len()
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        (0..SHARD_COUNT).map(|i| self.shard_len(i)).sum()
    }

    /// Start the periodic sweeper. The task holds a weak handle, so dropping
    /// the limiter also ends it.
    pub fn start_sweeper(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        self.sweeper.start(move || {
            let weak = weak.clone();
            async move {
                if let Some(limiter) = weak.upgrade() {
                    let removed = limiter.sweep();
                    if removed > 0 {
                        debug!(
                            event = "rate_limit_sweep",
                            removed,
                            remaining = limiter.bucket_count(),
                            "Swept idle rate buckets"
                        );
                    }
                }
            }
        })
    }

    pub async fn stop_sweeper(&self) {
        self.sweeper.stop().await;
    }
}
