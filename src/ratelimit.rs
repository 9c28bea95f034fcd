//! Per-key token-bucket rate limiting.
//!
//! Each key (principal id or channel id) gets an independent bucket with
//! capacity `burst`, refilled lazily at `rps` tokens/second on every
//! admission query. Denials never block; they report how long the caller
//! should wait before retrying.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateConfig;

/// Buckets idle longer than this are dropped on the next sweep.
const IDLE_EVICTION: Duration = Duration::from_secs(3_600);

/// Sweep for idle buckets once the map grows past this size.
const EVICTION_SWEEP_THRESHOLD: usize = 64;

/// Outcome of an admission query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// The request may proceed.
    Allowed,
    /// The request is throttled; retry after this many seconds.
    Denied {
        /// Seconds until one token will have refilled.
        retry_after: f64,
    },
}

impl Admission {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// One principal's (or channel's) bucket.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Lazily refill, then try to consume `cost` tokens.
    fn admit(&mut self, cost: f64, capacity: f64, rps: f64, now: Instant) -> Admission {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rps).min(capacity);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            Admission::Allowed
        } else {
            let retry_after = if rps > 0.0 {
                ((cost - self.tokens) / rps).max(0.0)
            } else {
                f64::INFINITY
            };
            Admission::Denied { retry_after }
        }
    }
}

/// Thread-safe token-bucket limiter keyed by string.
///
/// Instantiated twice by the gateway: once keyed by principal id and once
/// keyed by channel id, each with independent buckets.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rps: f64,
    capacity: f64,
}

impl RateLimiter {
    /// Create a limiter with the given refill rate and burst capacity.
    pub fn new(config: RateConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rps: config.rps,
            capacity: f64::from(config.burst),
        }
    }

    /// Admit a request charged at unit cost.
    pub fn admit(&self, key: &str) -> Admission {
        self.admit_cost(key, 1.0)
    }

    /// Admit a request with an explicit cost.
    pub fn admit_cost(&self, key: &str, cost: f64) -> Admission {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned lock means another thread panicked mid-admit; the
            // bucket state is still usable.
            Err(poisoned) => poisoned.into_inner(),
        };

        if buckets.len() > EVICTION_SWEEP_THRESHOLD {
            buckets.retain(|_, b| now.duration_since(b.last_refill) < IDLE_EVICTION);
        }

        let bucket = buckets
            .entry(key.to_owned())
            .or_insert_with(|| Bucket::full(self.capacity, now));
        bucket.admit(cost, self.capacity, self.rps, now)
    }

    /// Number of live buckets, for metrics and tests.
    pub fn bucket_count(&self) -> usize {
        match self.buckets.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
