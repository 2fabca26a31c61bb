//! Token-bucket rate limiter keyed by `(agent, operation class)`
//!
//! Each class has its own refill rate and burst. Token arithmetic
//! saturates at zero. A class whose window is zero (misconfiguration that
//! would divide by zero) is treated as unlimited but logged; a class whose
//! rate is zero rejects everything. When disabled, the fast path returns
//! allow immediately.

use dashmap::DashMap;
use engram_core::{AgentId, EngramResult, PermissionError, RateClass, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Operation classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Read,
    Write,
    Query,
    Admin,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Read => "read",
            OperationClass::Write => "write",
            OperationClass::Query => "query",
            OperationClass::Admin => "admin",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct ClassLimit {
    per_window: u32,
    burst: u32,
    window: Duration,
}

impl ClassLimit {
    fn from_rate(rate: RateClass) -> Self {
        Self {
            per_window: rate.per_minute,
            burst: rate.burst,
            window: Duration::from_secs(60),
        }
    }

    /// Bucket capacity. A zero-rate class has zero capacity and rejects.
    fn capacity(&self) -> f64 {
        if self.per_window == 0 {
            0.0
        } else {
            (self.per_window as f64).max(self.burst as f64)
        }
    }

    /// Tokens replenished per second; `None` when the window is zero and
    /// the division is undefined.
    fn refill_per_sec(&self) -> Option<f64> {
        let secs = self.window.as_secs_f64();
        if secs == 0.0 {
            return None;
        }
        Some(self.per_window as f64 / secs)
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// The limiter. Buckets are created lazily per key.
pub struct RateLimiter {
    enabled: AtomicBool,
    limits: RwLock<RateLimitConfig>,
    buckets: DashMap<(AgentId, OperationClass), Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            limits: RwLock::new(config),
            buckets: DashMap::new(),
        }
    }

    /// Atomically swap the configuration snapshot. Existing buckets keep
    /// their balances; new checks see the new rates.
    pub fn reload(&self, config: RateLimitConfig) {
        self.enabled.store(config.enabled, Ordering::Release);
        *self.limits.write().expect("rate limit config lock") = config;
    }

    fn class_limit(&self, class: OperationClass) -> ClassLimit {
        let limits = self.limits.read().expect("rate limit config lock");
        let rate = match class {
            OperationClass::Read => limits.read,
            OperationClass::Write => limits.write,
            OperationClass::Query => limits.query,
            OperationClass::Admin => limits.admin,
        };
        ClassLimit::from_rate(rate)
    }

    /// Check and consume one token. Errors with a rate-limit permission
    /// error carrying a retry hint when the bucket is empty.
    pub fn check(&self, agent: &AgentId, class: OperationClass) -> EngramResult<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let limit = self.class_limit(class);

        let Some(refill) = limit.refill_per_sec() else {
            // Misconfigured window: unlimited, but visibly so.
            tracing::warn!(class = %class, "rate class has a zero window; allowing unlimited");
            return Ok(());
        };

        let now = Instant::now();
        let capacity = limit.capacity();
        let mut bucket = self
            .buckets
            .entry((agent.clone(), class))
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });

        // Refill for elapsed time, clamped to capacity.
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            // Saturating: the balance never goes below zero.
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            return Ok(());
        }

        let deficit = 1.0 - bucket.tokens;
        let retry_after_ms = if refill > 0.0 {
            Some((deficit / refill * 1000.0).ceil() as u64)
        } else {
            None
        };
        Err(PermissionError::RateLimited {
            agent: agent.clone(),
            class: class.as_str().to_string(),
            retry_after_ms,
        }
        .into())
    }

    /// Number of live buckets, for stats surfaces.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_minute: u32, burst: u32, enabled: bool) -> RateLimitConfig {
        let class = RateClass { per_minute, burst };
        RateLimitConfig {
            enabled,
            read: class,
            write: class,
            query: class,
            admin: class,
        }
    }

    fn agent(name: &str) -> AgentId {
        AgentId::new(name).unwrap()
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::new(config(0, 0, false));
        let a = agent("a");
        for _ in 0..100 {
            limiter.check(&a, OperationClass::Write).unwrap();
        }
    }

    #[test]
    fn test_zero_rate_rejects_immediately() {
        let limiter = RateLimiter::new(config(0, 0, true));
        let err = limiter.check(&agent("a"), OperationClass::Write).unwrap_err();
        assert_eq!(err.code(), 6002);
    }

    #[test]
    fn test_rate_of_one_allows_one_then_rejects() {
        let limiter = RateLimiter::new(config(1, 0, true));
        let a = agent("a");
        limiter.check(&a, OperationClass::Read).unwrap();
        let err = limiter.check(&a, OperationClass::Read).unwrap_err();
        match err {
            engram_core::EngramError::Permission(PermissionError::RateLimited {
                retry_after_ms,
                ..
            }) => {
                assert!(retry_after_ms.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_agents_and_classes_are_independent() {
        let limiter = RateLimiter::new(config(1, 0, true));
        let a = agent("a");
        let b = agent("b");

        limiter.check(&a, OperationClass::Read).unwrap();
        // Exhausting A's read budget affects neither B nor A's writes.
        limiter.check(&b, OperationClass::Read).unwrap();
        limiter.check(&a, OperationClass::Write).unwrap();
        assert!(limiter.check(&a, OperationClass::Read).is_err());
    }

    #[test]
    fn test_reload_swaps_rates() {
        let limiter = RateLimiter::new(config(1, 0, true));
        let a = agent("a");
        limiter.check(&a, OperationClass::Read).unwrap();
        assert!(limiter.check(&a, OperationClass::Read).is_err());

        limiter.reload(config(0, 0, false));
        limiter.check(&a, OperationClass::Read).unwrap();
    }

    #[test]
    fn test_burst_extends_capacity() {
        let limiter = RateLimiter::new(config(2, 5, true));
        let a = agent("a");
        // Capacity is max(rate, burst) = 5.
        for _ in 0..5 {
            limiter.check(&a, OperationClass::Query).unwrap();
        }
        assert!(limiter.check(&a, OperationClass::Query).is_err());
    }
}
