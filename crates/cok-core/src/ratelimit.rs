//! Per-identifier token-bucket rate limiting.
//!
//! Buckets are created lazily on first use and refilled lazily on access, so
//! idle identifiers cost nothing until the periodic sweep evicts them. All
//! state sits behind one mutex; nothing is held across awaits.
//!
//! Time is passed explicitly through the `*_at` methods so tests can drive
//! the clock; the public methods sample `Instant::now()`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Bucket capacity: the burst a cold identifier may spend at once.
    pub capacity: f64,
    /// Refill rate in tokens per second.
    pub refill_rate: f64,
    /// Tokens one request costs.
    pub cost: f64,
    /// How long a full, untouched bucket survives before eviction.
    pub idle_window: Duration,
    /// Minimum spacing between eviction sweeps.
    pub sweep_interval: Duration,
}

impl RateLimiterConfig {
    /// Preset for API-style endpoints: 60 burst, 1 token/s.
    pub fn api() -> Self {
        RateLimiterConfig {
            capacity: 60.0,
            refill_rate: 1.0,
            ..Default::default()
        }
    }

    /// Preset for control-connection attempts: 10 burst, 0.167 token/s.
    pub fn connection() -> Self {
        RateLimiterConfig {
            capacity: 10.0,
            refill_rate: 0.167,
            ..Default::default()
        }
    }

    /// Preset for gateway HTTP traffic: 120 burst, 2 tokens/s.
    pub fn http() -> Self {
        RateLimiterConfig {
            capacity: 120.0,
            refill_rate: 2.0,
            ..Default::default()
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            capacity: 60.0,
            refill_rate: 1.0,
            cost: 1.0,
            idle_window: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, config: &RateLimiterConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(config.capacity);
        self.last_refill = now;
    }
}

struct Buckets {
    by_id: HashMap<String, TokenBucket>,
    last_sweep: Instant,
}

/// Token-bucket rate limiter keyed by caller identifier (IP, key, host).
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        RateLimiter {
            config,
            buckets: Mutex::new(Buckets {
                by_id: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Spend one request's worth of tokens for `id`. Returns whether the
    /// request is admitted.
    pub fn try_consume(&self, id: &str) -> bool {
        self.try_consume_at(id, Instant::now())
    }

    /// How long until a consume for `id` would succeed. `None` when it
    /// would succeed right now.
    pub fn retry_after(&self, id: &str) -> Option<Duration> {
        self.retry_after_at(id, Instant::now())
    }

    /// Number of identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().by_id.len()
    }

    pub(crate) fn try_consume_at(&self, id: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        self.maybe_sweep(&mut buckets, now);

        let bucket = buckets.by_id.entry(id.to_string()).or_insert(TokenBucket {
            tokens: self.config.capacity,
            last_refill: now,
        });
        bucket.refill(&self.config, now);

        if bucket.tokens >= self.config.cost {
            bucket.tokens -= self.config.cost;
            true
        } else {
            false
        }
    }

    pub(crate) fn retry_after_at(&self, id: &str, now: Instant) -> Option<Duration> {
        let buckets = self.buckets.lock();
        let bucket = match buckets.by_id.get(id) {
            Some(bucket) => *bucket,
            // Unknown identifier starts with a full bucket.
            None => return None,
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        let tokens = (bucket.tokens + elapsed * self.config.refill_rate).min(self.config.capacity);
        if tokens >= self.config.cost {
            return None;
        }
        let deficit = self.config.cost - tokens;
        Some(Duration::from_secs_f64(deficit / self.config.refill_rate))
    }

    /// Drop buckets that have been idle past the window and are back at
    /// full capacity; they are indistinguishable from never-seen ids.
    fn maybe_sweep(&self, buckets: &mut Buckets, now: Instant) {
        if now.saturating_duration_since(buckets.last_sweep) < self.config.sweep_interval {
            return;
        }
        buckets.last_sweep = now;

        let config = self.config;
        buckets.by_id.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill);
            if idle < config.idle_window {
                return true;
            }
            let tokens =
                (bucket.tokens + idle.as_secs_f64() * config.refill_rate).min(config.capacity);
            tokens < config.capacity
        });
    }
}
