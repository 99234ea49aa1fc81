//! Quota enforcement engine: tier lookup, window arithmetic, blocking
//! escalation, fail-open on store faults.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::store::{RateLimitEntry, RateLimitStore, StoreError};
use super::tiers::{tier_for_tool, RateLimitTier, TierConfig, TierConfigPatch};
use super::{Clock, SystemClock};

/// Replaceable store-key composition. Default: `rate_limit:{identifier}:{tool}`.
pub type KeyGenerator = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

fn default_key_generator() -> KeyGenerator {
    Arc::new(|identifier, tool_name| format!("rate_limit:{}:{}", identifier, tool_name))
}

/// Outcome of one quota check. Computed, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// The quota for this tier/window
    pub limit: u64,
    /// Requests counted so far in the window (including this one)
    pub current: u64,
    /// Requests left in the window
    pub remaining: u64,
    /// Epoch milliseconds at which the window resets
    pub reset_time: i64,
    /// Seconds until a retry could succeed, set on denial
    pub retry_after: Option<u64>,
    /// The tier the checked tool resolved to
    pub tier: RateLimitTier,
    /// Escalated block deadline, if one is active or was just set
    pub block_until: Option<i64>,
}

/// Per-call options for a quota check.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Bypass the check entirely (trusted internal callers)
    pub skip_check: bool,
    /// Partial override merged onto the resolved tier config
    pub config: Option<TierConfigPatch>,
}

/// The rate limiter engine.
///
/// Holds hot-patchable per-tier configs and delegates counter state to a
/// [`RateLimitStore`]. One instance is shared across all invocations.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    tier_configs: RwLock<HashMap<RateLimitTier, TierConfig>>,
    enabled: AtomicBool,
    key_generator: KeyGenerator,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create an engine over a store, with default tier configs and the
    /// system clock.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create an engine with an injected clock.
    pub fn with_clock(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        let mut tier_configs = HashMap::new();
        for tier in [
            RateLimitTier::Critical,
            RateLimitTier::High,
            RateLimitTier::Medium,
            RateLimitTier::Low,
        ] {
            tier_configs.insert(tier, TierConfig::defaults(tier));
        }
        Self {
            store,
            tier_configs: RwLock::new(tier_configs),
            enabled: AtomicBool::new(true),
            key_generator: default_key_generator(),
            clock,
        }
    }

    /// Replace the store-key composition.
    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    /// Maintenance toggle. A disabled engine allows everything without
    /// touching the store.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether enforcement is currently on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Hot-patch one tier's config at runtime.
    pub fn update_tier_config(&self, tier: RateLimitTier, patch: &TierConfigPatch) {
        let mut configs = self.tier_configs.write();
        let merged = configs
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierConfig::defaults(tier))
            .merge(patch);
        configs.insert(tier, merged);
    }

    /// The effective config for a tier.
    pub fn config_for(&self, tier: RateLimitTier) -> TierConfig {
        self.tier_configs
            .read()
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierConfig::defaults(tier))
    }

    /// Resolve tier and effective config for a tool, applying a per-call
    /// override if given.
    fn resolve_config(&self, tool_name: &str, opts: &CheckOptions) -> TierConfig {
        let tier = tier_for_tool(tool_name);
        let base = self.config_for(tier);
        match &opts.config {
            Some(patch) => base.merge(patch),
            None => base,
        }
    }

    /// Check the quota for one `(identifier, tool)` operation.
    ///
    /// Never fails: store faults are logged and treated as fail-open, so a
    /// storage outage degrades enforcement, not availability.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        tool_name: &str,
        opts: &CheckOptions,
    ) -> RateLimitResult {
        let config = self.resolve_config(tool_name, opts);
        let now = self.clock.now_ms();

        if !self.is_enabled() || opts.skip_check {
            return self.pass_through(&config, now);
        }

        let key = (self.key_generator)(identifier, tool_name);

        // Active block short-circuits before any counting.
        match self.store.get(&key).await {
            Ok(Some(entry)) => {
                if let Some(block_until) = entry.block_until.filter(|b| *b > now) {
                    debug!(identifier, tool = tool_name, block_until, "request blocked");
                    return self.blocked(&config, &entry, now, block_until);
                }
            }
            Ok(None) => {}
            Err(e) => return self.fail_open(&config, now, identifier, tool_name, &e),
        }

        let ttl = entry_ttl(&config);
        let entry = match self.store.increment(&key, config.window_ms, ttl).await {
            Ok(entry) => entry,
            Err(e) => return self.fail_open(&config, now, identifier, tool_name, &e),
        };

        if entry.count > config.max_requests {
            if let Some(block_ms) = config.block_duration_ms {
                // Escalate: all further requests for this key are denied
                // outright until the block lapses.
                let block_until = now + block_ms;
                let blocked_entry = RateLimitEntry {
                    block_until: Some(block_until),
                    ..entry.clone()
                };
                if let Err(e) = self.store.set(&key, blocked_entry, ttl).await {
                    return self.fail_open(&config, now, identifier, tool_name, &e);
                }
                warn!(
                    identifier,
                    tool = tool_name,
                    tier = %config.tier,
                    block_until,
                    "quota exceeded, blocking window set"
                );
                // The violating call itself reports the window reset as its
                // retry hint; only calls landing under the block report the
                // block deadline.
                return RateLimitResult {
                    allowed: false,
                    limit: config.max_requests,
                    current: entry.count,
                    remaining: 0,
                    reset_time: entry.reset_time,
                    retry_after: Some(ceil_seconds(entry.reset_time - now)),
                    tier: config.tier,
                    block_until: Some(block_until),
                };
            }

            debug!(identifier, tool = tool_name, tier = %config.tier, "quota exceeded");
            return RateLimitResult {
                allowed: false,
                limit: config.max_requests,
                current: entry.count,
                remaining: 0,
                reset_time: entry.reset_time,
                retry_after: Some(ceil_seconds(entry.reset_time - now)),
                tier: config.tier,
                block_until: None,
            };
        }

        RateLimitResult {
            allowed: true,
            limit: config.max_requests,
            current: entry.count,
            remaining: config.max_requests.saturating_sub(entry.count),
            reset_time: entry.reset_time,
            retry_after: None,
            tier: config.tier,
            block_until: entry.block_until,
        }
    }

    /// Roll back one counted request, used when the tier config says not to
    /// bill successful or failed calls. Best effort; store faults are
    /// swallowed like any other.
    pub async fn rollback(&self, identifier: &str, tool_name: &str) {
        let key = (self.key_generator)(identifier, tool_name);
        let entry = match self.store.get(&key).await {
            Ok(Some(entry)) if entry.count > 0 => entry,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, identifier, tool = tool_name, "rollback read failed");
                return;
            }
        };
        let config = self.config_for(tier_for_tool(tool_name));
        let decremented = RateLimitEntry {
            count: entry.count - 1,
            ..entry
        };
        if let Err(e) = self.store.set(&key, decremented, entry_ttl(&config)).await {
            warn!(error = %e, identifier, tool = tool_name, "rollback write failed");
        }
    }

    /// Delete one `(identifier, tool)` counter.
    pub async fn reset_limit(&self, identifier: &str, tool_name: &str) -> Result<(), StoreError> {
        let key = (self.key_generator)(identifier, tool_name);
        self.store.delete(&key).await
    }

    /// Clear every counter.
    pub async fn reset_all_limits(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }

    /// Allowed result without consulting the store.
    fn pass_through(&self, config: &TierConfig, now: i64) -> RateLimitResult {
        RateLimitResult {
            allowed: true,
            limit: config.max_requests,
            current: 0,
            remaining: config.max_requests,
            reset_time: now + config.window_ms,
            retry_after: None,
            tier: config.tier,
            block_until: None,
        }
    }

    fn blocked(
        &self,
        config: &TierConfig,
        entry: &RateLimitEntry,
        now: i64,
        block_until: i64,
    ) -> RateLimitResult {
        RateLimitResult {
            allowed: false,
            limit: config.max_requests,
            current: entry.count,
            remaining: 0,
            reset_time: entry.reset_time,
            retry_after: Some(ceil_seconds(block_until - now)),
            tier: config.tier,
            block_until: Some(block_until),
        }
    }

    /// Availability over strict enforcement: a store fault permits the
    /// operation.
    fn fail_open(
        &self,
        config: &TierConfig,
        now: i64,
        identifier: &str,
        tool_name: &str,
        error: &StoreError,
    ) -> RateLimitResult {
        warn!(
            error = %error,
            identifier,
            tool = tool_name,
            "rate limit store unavailable, failing open"
        );
        self.pass_through(config, now)
    }
}

/// Store-entry lifetime: the window plus any block that could be set in it.
fn entry_ttl(config: &TierConfig) -> Option<Duration> {
    let ms = config.window_ms + config.block_duration_ms.unwrap_or(0);
    Some(Duration::from_millis(ms.max(0) as u64))
}

/// Millisecond delta to whole seconds, rounded up, never zero for a
/// positive delta.
fn ceil_seconds(delta_ms: i64) -> u64 {
    if delta_ms <= 0 {
        return 0;
    }
    (delta_ms + 999).div_euclid(1000) as u64
}
