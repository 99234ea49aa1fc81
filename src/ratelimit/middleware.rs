//! HTTP-facing rate limit hooks.
//!
//! `before` runs ahead of protocol parsing: it extracts the caller identity
//! and target tool from the raw request, consults the engine, and denies
//! with a 429 envelope when the quota says no. `after` annotates the
//! outgoing response with usage headers and rolls back the counter for
//! responses the tier config says not to bill.

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::debug;

use crate::error::jsonrpc::{error_envelope, JsonRpcError};
use crate::error::GATEWAY_ERROR_CODE;

use super::limiter::{CheckOptions, RateLimiter, RateLimitResult};
use super::tiers::{tier_for_tool, TierConfig};

/// Extracts the caller identity from request headers and peer address.
pub type IdentifierExtractor = Arc<dyn Fn(&HeaderMap, Option<IpAddr>) -> String + Send + Sync>;

/// Extracts the target tool name from the raw request body.
pub type ToolNameExtractor = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

/// Default identity: API key header, else forwarded/peer source IP.
fn default_identifier(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return key.to_string();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    match peer {
        Some(ip) => ip.to_string(),
        None => "anonymous".to_string(),
    }
}

/// Default tool name: JSON-RPC `method`, or `params.name` for `tools/call`.
///
/// Runs before protocol validation, so parsing is lenient: anything
/// unreadable yields `None` and the engine's default tier applies.
fn default_tool_name(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let first = match &value {
        Value::Array(items) => items.first()?,
        obj => obj,
    };
    let method = first.get("method")?.as_str()?;
    if method == "tools/call" {
        if let Some(name) = first
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
        {
            return Some(name.to_string());
        }
    }
    Some(method.to_string())
}

/// Context carried from `before` to `after` for one invocation.
#[derive(Debug, Clone)]
pub struct RateLimitContext {
    /// Caller identity the quota was charged to
    pub identifier: String,
    /// Tool name the quota was charged for
    pub tool: String,
    /// The engine's decision
    pub result: RateLimitResult,
    /// Effective tier config at decision time
    pub config: TierConfig,
}

/// Rate limit middleware wrapping the protocol gateway.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    identify: IdentifierExtractor,
    tool_name: ToolNameExtractor,
    expose_headers: bool,
}

impl RateLimitMiddleware {
    /// Create middleware with the default extractors and headers disabled.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            identify: Arc::new(default_identifier),
            tool_name: Arc::new(default_tool_name),
            expose_headers: false,
        }
    }

    /// Replace the identity extractor.
    pub fn with_identifier_extractor(mut self, identify: IdentifierExtractor) -> Self {
        self.identify = identify;
        self
    }

    /// Replace the tool-name extractor.
    pub fn with_tool_extractor(mut self, tool_name: ToolNameExtractor) -> Self {
        self.tool_name = tool_name;
        self
    }

    /// Opt in to `X-RateLimit-*` response headers.
    pub fn expose_headers(mut self, expose: bool) -> Self {
        self.expose_headers = expose;
        self
    }

    /// The underlying engine, for admin operations.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Pre-handler hook: identity/tool extraction and quota check.
    ///
    /// # Errors
    ///
    /// Returns a ready 429 response when the quota denies the call.
    pub async fn before(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        peer: Option<IpAddr>,
    ) -> Result<RateLimitContext, Box<Response>> {
        let identifier = (self.identify)(headers, peer);
        let tool = (self.tool_name)(body).unwrap_or_else(|| "unknown".to_string());

        let result = self
            .limiter
            .check_rate_limit(&identifier, &tool, &CheckOptions::default())
            .await;
        let config = self.limiter.config_for(tier_for_tool(&tool));

        debug!(
            identifier = %identifier,
            tool = %tool,
            tier = %result.tier,
            allowed = result.allowed,
            remaining = result.remaining,
            "rate limit checked"
        );

        if !result.allowed {
            return Err(Box::new(deny_response(&tool, &result)));
        }

        Ok(RateLimitContext {
            identifier,
            tool,
            result,
            config,
        })
    }

    /// Post-handler hook: annotate headers, honor skip flags.
    pub async fn after(&self, ctx: &RateLimitContext, response: &mut Response) {
        if self.expose_headers {
            annotate_headers(response.headers_mut(), &ctx.result);
        }

        let succeeded = response.status().as_u16() < 400;
        let skip = (succeeded && ctx.config.skip_successful_requests)
            || (!succeeded && ctx.config.skip_failed_requests);
        if skip {
            self.limiter.rollback(&ctx.identifier, &ctx.tool).await;
        }
    }
}

/// Write the opt-in usage headers onto a response.
fn annotate_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    put("x-ratelimit-limit", result.limit.to_string());
    put("x-ratelimit-remaining", result.remaining.to_string());
    put(
        "x-ratelimit-reset",
        (result.reset_time + 999).div_euclid(1000).to_string(),
    );
    put("x-ratelimit-tier", result.tier.as_str().to_string());
    if let Some(retry_after) = result.retry_after {
        put("retry-after", retry_after.to_string());
    }
    if let Some(block_until) = result.block_until {
        put(
            "x-ratelimit-blockuntil",
            (block_until + 999).div_euclid(1000).to_string(),
        );
    }
}

/// Build the 429 denial response: usage headers plus a JSON-RPC envelope
/// with a human-readable message.
fn deny_response(tool: &str, result: &RateLimitResult) -> Response {
    let message = match result.retry_after {
        Some(seconds) => format!(
            "Rate limit exceeded for tool '{}' ({} tier). Retry after {} seconds.",
            tool, result.tier, seconds
        ),
        None => format!(
            "Rate limit exceeded for tool '{}' ({} tier).",
            tool, result.tier
        ),
    };
    let body = error_envelope(&JsonRpcError::new(GATEWAY_ERROR_CODE, message)).to_string();

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    annotate_headers(response.headers_mut(), result);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::store::MemoryStore;
    use crate::ratelimit::{ManualClock, RateLimitTier};
    use serde_json::json;

    fn middleware() -> RateLimitMiddleware {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = Arc::new(RateLimiter::with_clock(store, clock));
        RateLimitMiddleware::new(limiter).expose_headers(true)
    }

    #[test]
    fn test_identifier_prefers_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key-123"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        assert_eq!(default_identifier(&headers, None), "key-123");
    }

    #[test]
    fn test_identifier_falls_back_to_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 10.0.0.2"),
        );
        assert_eq!(default_identifier(&headers, None), "10.0.0.1");
    }

    #[test]
    fn test_identifier_falls_back_to_peer_then_anonymous() {
        let headers = HeaderMap::new();
        let peer: IpAddr = "192.168.1.5".parse().unwrap();
        assert_eq!(default_identifier(&headers, Some(peer)), "192.168.1.5");
        assert_eq!(default_identifier(&headers, None), "anonymous");
    }

    #[test]
    fn test_tool_name_from_method() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"read_account"}"#;
        assert_eq!(default_tool_name(body), Some("read_account".to_string()));
    }

    #[test]
    fn test_tool_name_from_tools_call_params() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "create_live_algorithm", "arguments": {}}
        })
        .to_string();
        assert_eq!(
            default_tool_name(body.as_bytes()),
            Some("create_live_algorithm".to_string())
        );
    }

    #[test]
    fn test_tool_name_from_batch_first_element() {
        let body = br#"[{"jsonrpc":"2.0","id":1,"method":"read_file"},{"jsonrpc":"2.0","id":2,"method":"other"}]"#;
        assert_eq!(default_tool_name(body), Some("read_file".to_string()));
    }

    #[test]
    fn test_tool_name_unparseable_is_none() {
        assert_eq!(default_tool_name(b"not json"), None);
        assert_eq!(default_tool_name(b"[]"), None);
    }

    #[tokio::test]
    async fn test_before_allows_and_builds_context() {
        let mw = middleware();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"read_account"}}"#;

        let ctx = mw.before(&headers, body, None).await.expect("allowed");
        assert_eq!(ctx.identifier, "k1");
        assert_eq!(ctx.tool, "read_account");
        assert_eq!(ctx.result.tier, RateLimitTier::Low);
    }

    #[tokio::test]
    async fn test_denial_returns_429_with_headers() {
        let mw = middleware();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"create_live_algorithm"}}"#;

        for _ in 0..5 {
            mw.before(&headers, body, None).await.expect("under quota");
        }
        let denied = mw.before(&headers, body, None).await.unwrap_err();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            denied
                .headers()
                .get("x-ratelimit-tier")
                .and_then(|v| v.to_str().ok()),
            Some("CRITICAL")
        );
        assert!(denied.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_after_annotates_headers() {
        let mw = middleware();
        let headers = HeaderMap::new();
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"unclassified_tool"}"#;

        let ctx = mw.before(&headers, body, None).await.expect("allowed");
        let mut response = StatusCode::OK.into_response();
        mw.after(&ctx, &mut response).await;

        let headers = response.headers();
        assert_eq!(
            headers.get("x-ratelimit-limit").and_then(|v| v.to_str().ok()),
            Some("60")
        );
        assert_eq!(
            headers
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok()),
            Some("59")
        );
        assert_eq!(
            headers.get("x-ratelimit-tier").and_then(|v| v.to_str().ok()),
            Some("MEDIUM")
        );
    }

    #[tokio::test]
    async fn test_skip_failed_requests_rolls_back() {
        let mw = middleware();
        let headers = HeaderMap::new();
        // LOW tier defaults to skip_failed_requests.
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"read_account"}"#;

        let ctx = mw.before(&headers, body, None).await.expect("allowed");
        assert_eq!(ctx.result.current, 1);

        let mut response = StatusCode::BAD_GATEWAY.into_response();
        mw.after(&ctx, &mut response).await;

        // The failed call was un-billed: the next check counts as the first.
        let ctx = mw.before(&headers, body, None).await.expect("allowed");
        assert_eq!(ctx.result.current, 1);
    }
}
