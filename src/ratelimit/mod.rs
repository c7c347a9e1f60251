//! Token-bucket rate limiting keyed by client id.
//!
//! Grounded on `enterprise::ratelimit::algorithm` (`Decision`, `TokenBucket`,
//! the refill-on-consume arithmetic); per-key state lives in a `DashMap`
//! exactly as the teacher keeps it, rather than inside the policy struct.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the rate limiter. Currently exhaustive over
/// configuration problems; `consume` itself never fails, only denies.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The limiter was configured with a non-positive capacity or refill rate.
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for the rate limiting module.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Token-bucket configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket can hold.
    pub capacity: f64,
    /// Tokens refilled per second.
    pub refill_per_sec: f64,
    /// How long an idle bucket survives before the sweeper evicts it.
    pub idle_eviction_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_per_sec: 5.0,
            idle_eviction_ms: 5 * 60 * 1000,
        }
    }
}

/// The outcome of a `consume` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request is admitted.
    Allowed,
    /// The request is denied; retry after the given delay, in milliseconds.
    Denied {
        /// Suggested backoff before retrying.
        retry_after_ms: u64,
    },
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// A token-bucket limiter sharded by client id.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    /// Construct a limiter from `config`.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        if config.capacity <= 0.0 || config.refill_per_sec <= 0.0 {
            return Err(RateLimitError::InvalidConfig(
                "capacity and refill_per_sec must be positive".to_string(),
            ));
        }
        Ok(Self {
            config,
            buckets: DashMap::new(),
        })
    }

    /// Attempt to consume one token for `client_id`, refilling first.
    pub fn consume(&self, client_id: &str) -> Decision {
        self.consume_n(client_id, 1.0)
    }

    /// Attempt to consume `cost` tokens for `client_id`.
    pub fn consume_n(&self, client_id: &str, cost: f64) -> Decision {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(client_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.config.capacity,
            last_refill: now,
            last_used: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.capacity);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Decision::Allowed
        } else {
            let deficit = cost - bucket.tokens;
            let wait_secs = deficit / self.config.refill_per_sec;
            Decision::Denied {
                retry_after_ms: (wait_secs * 1000.0).ceil() as u64,
            }
        }
    }

    /// Remove buckets that have been idle for longer than
    /// `idle_eviction_ms`. Intended to run on a periodic timer.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = Duration::from_millis(self.config.idle_eviction_ms);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| now.duration_since(bucket.last_used) < ttl);
        before - self.buckets.len()
    }

    /// Number of tracked buckets, for diagnostics/tests.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
