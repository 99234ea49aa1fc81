//! Tiered rate limiting for the trading-platform tool surface.
//!
//! Quotas are enforced per `(caller identity, tool)` key against windowed
//! counters in a pluggable store. Tools map to risk tiers; violating a
//! tier's quota escalates to a blocking window when the tier configures
//! one. Storage faults never deny traffic: the engine fails open.

pub mod limiter;
pub mod middleware;
pub mod store;
pub mod tiers;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub use limiter::{CheckOptions, KeyGenerator, RateLimitResult, RateLimiter};
pub use middleware::{RateLimitContext, RateLimitMiddleware};
pub use store::{MemoryStore, RateLimitEntry, RateLimitStore, StoreError};
pub use tiers::{tier_for_tool, RateLimitTier, TierConfig, TierConfigPatch};

/// Time source for window arithmetic, in epoch milliseconds.
///
/// Injected so the escalation behavior is testable without sleeping.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests and simulations.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given epoch-milliseconds instant.
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    /// Advance by a duration.
    pub fn advance(&self, by: Duration) {
        self.advance_ms(by.as_millis() as i64);
    }

    /// Advance by milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
