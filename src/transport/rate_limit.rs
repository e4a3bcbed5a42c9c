//! Rate-limit middleware contract
//!
//! Token bucket per `Sbp-Agent-Id` (fallback: source IP), refilling
//! linearly at `max/window` and consuming one token per request
//! (spec.md §9). Rejects with `-32004` and a `retry_after_ms` hint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A rate limiter is a pluggable hook (spec.md §4.7 Middleware contract):
/// the transport only needs something that can answer "is this key
/// allowed right now". The default is an in-process token bucket; a
/// deployment could swap in a distributed limiter behind the same trait.
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> RateLimitDecision;
}

pub struct TokenBucketLimiter {
    max_per_minute: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn check(&self, key: &str) -> RateLimitDecision {
        if self.max_per_minute == 0 {
            return RateLimitDecision {
                allowed: true,
                retry_after_ms: 0,
            };
        }

        let capacity = self.max_per_minute as f64;
        let refill_per_ms = capacity / 60_000.0;

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * refill_per_ms).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                retry_after_ms: 0,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_ms = (deficit / refill_per_ms).ceil() as u64;
            RateLimitDecision {
                allowed: false,
                retry_after_ms,
            }
        }
    }
}
