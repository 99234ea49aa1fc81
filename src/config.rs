//! Environment-driven gateway configuration.

use tracing::warn;

/// Gateway settings, loaded from `TRADEGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Master toggle for quota enforcement
    pub rate_limit_enabled: bool,
    /// Emit `X-RateLimit-*` response headers
    pub rate_limit_headers: bool,
    /// Seconds between expired-entry sweeps of the in-memory store
    pub store_sweep_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_body_size: 1024 * 1024, // 1MB
            rate_limit_enabled: true,
            rate_limit_headers: true,
            store_sweep_secs: 60,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TRADEGATE_MAX_REQUEST_BODY_BYTES` (default: 1048576)
    /// - `TRADEGATE_RATE_LIMIT_ENABLED` (default: true)
    /// - `TRADEGATE_RATE_LIMIT_HEADERS` (default: true)
    /// - `TRADEGATE_STORE_SWEEP_SECS` (default: 60)
    ///
    /// Invalid values are logged and fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TRADEGATE_MAX_REQUEST_BODY_BYTES") {
            match val.parse::<usize>() {
                Ok(bytes) if bytes > 0 => config.max_body_size = bytes,
                _ => warn!(
                    env_var = "TRADEGATE_MAX_REQUEST_BODY_BYTES",
                    value = %val,
                    "Invalid value for environment variable, using default"
                ),
            }
        }

        if let Ok(val) = std::env::var("TRADEGATE_RATE_LIMIT_ENABLED") {
            match parse_bool(&val) {
                Some(enabled) => config.rate_limit_enabled = enabled,
                None => warn!(
                    env_var = "TRADEGATE_RATE_LIMIT_ENABLED",
                    value = %val,
                    "Invalid value for environment variable, using default"
                ),
            }
        }

        if let Ok(val) = std::env::var("TRADEGATE_RATE_LIMIT_HEADERS") {
            match parse_bool(&val) {
                Some(expose) => config.rate_limit_headers = expose,
                None => warn!(
                    env_var = "TRADEGATE_RATE_LIMIT_HEADERS",
                    value = %val,
                    "Invalid value for environment variable, using default"
                ),
            }
        }

        if let Ok(val) = std::env::var("TRADEGATE_STORE_SWEEP_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.store_sweep_secs = secs,
                _ => warn!(
                    env_var = "TRADEGATE_STORE_SWEEP_SECS",
                    value = %val,
                    "Invalid value for environment variable, using default"
                ),
            }
        }

        config
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
