//! Risk tiers and per-tier quota configuration.
//!
//! Every tool maps to one of four ordered risk tiers. Operations that move
//! money or touch live deployments sit in CRITICAL with a small quota and a
//! long escalation block; read-only operations sit in LOW.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Named risk category determining an operation's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateLimitTier {
    /// Live trading mutations: tightest quota, escalating block.
    Critical,
    /// Expensive or destructive project operations.
    High,
    /// Default for anything unclassified.
    Medium,
    /// Cheap read-only operations.
    Low,
}

impl RateLimitTier {
    /// Header/label form of the tier name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitTier::Critical => "CRITICAL",
            RateLimitTier::High => "HIGH",
            RateLimitTier::Medium => "MEDIUM",
            RateLimitTier::Low => "LOW",
        }
    }
}

impl std::fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota configuration for one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierConfig {
    /// The tier this config applies to
    pub tier: RateLimitTier,
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Length of the outright-deny block set on quota violation, if any
    pub block_duration_ms: Option<i64>,
    /// Roll back the counter for requests that succeeded
    pub skip_successful_requests: bool,
    /// Roll back the counter for requests that failed
    pub skip_failed_requests: bool,
}

impl TierConfig {
    /// Built-in defaults for a tier.
    pub fn defaults(tier: RateLimitTier) -> Self {
        match tier {
            RateLimitTier::Critical => Self {
                tier,
                window_ms: 60_000,
                max_requests: 5,
                block_duration_ms: Some(300_000),
                skip_successful_requests: false,
                skip_failed_requests: false,
            },
            RateLimitTier::High => Self {
                tier,
                window_ms: 60_000,
                max_requests: 20,
                block_duration_ms: Some(120_000),
                skip_successful_requests: false,
                skip_failed_requests: false,
            },
            RateLimitTier::Medium => Self {
                tier,
                window_ms: 60_000,
                max_requests: 60,
                block_duration_ms: None,
                skip_successful_requests: false,
                skip_failed_requests: false,
            },
            RateLimitTier::Low => Self {
                tier,
                window_ms: 60_000,
                max_requests: 120,
                block_duration_ms: None,
                skip_successful_requests: false,
                skip_failed_requests: true,
            },
        }
    }

    /// Apply a partial override on top of this config.
    pub fn merge(&self, patch: &TierConfigPatch) -> Self {
        Self {
            tier: self.tier,
            window_ms: patch.window_ms.unwrap_or(self.window_ms),
            max_requests: patch.max_requests.unwrap_or(self.max_requests),
            block_duration_ms: patch.block_duration_ms.unwrap_or(self.block_duration_ms),
            skip_successful_requests: patch
                .skip_successful_requests
                .unwrap_or(self.skip_successful_requests),
            skip_failed_requests: patch.skip_failed_requests.unwrap_or(self.skip_failed_requests),
        }
    }
}

/// Partial tier-config override, merged per call or patched at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierConfigPatch {
    /// Override the window length
    pub window_ms: Option<i64>,
    /// Override the per-window quota
    pub max_requests: Option<u64>,
    /// Override (or remove, via `Some(None)`) the block duration
    pub block_duration_ms: Option<Option<i64>>,
    /// Override successful-request rollback
    pub skip_successful_requests: Option<bool>,
    /// Override failed-request rollback
    pub skip_failed_requests: Option<bool>,
}

/// Static tool → tier table for the trading platform's tool surface.
///
/// Unlisted tools default to MEDIUM.
static TOOL_TIERS: LazyLock<HashMap<&'static str, RateLimitTier>> = LazyLock::new(|| {
    use RateLimitTier::*;
    let mut table = HashMap::new();

    // Live trading mutations
    for tool in [
        "create_live_algorithm",
        "stop_live_algorithm",
        "liquidate_live_algorithm",
        "create_live_command",
        "broadcast_live_command",
    ] {
        table.insert(tool, Critical);
    }

    // Expensive or destructive project operations
    for tool in [
        "create_project",
        "delete_project",
        "create_backtest",
        "delete_backtest",
        "create_compile",
        "create_file",
        "update_file_contents",
        "delete_file",
        "create_optimization",
        "abort_optimization",
    ] {
        table.insert(tool, High);
    }

    // Read-only operations
    for tool in [
        "read_account",
        "list_projects",
        "read_project",
        "read_file",
        "read_backtest",
        "list_backtests",
        "read_backtest_chart",
        "read_backtest_orders",
        "read_live_algorithm",
        "list_live_algorithms",
        "read_live_logs",
        "read_live_portfolio",
        "read_live_orders",
        "read_optimization",
    ] {
        table.insert(tool, Low);
    }

    table
});

/// Resolve the tier for a tool name. Unknown tools are MEDIUM.
pub fn tier_for_tool(tool_name: &str) -> RateLimitTier {
    TOOL_TIERS
        .get(tool_name)
        .copied()
        .unwrap_or(RateLimitTier::Medium)
}
