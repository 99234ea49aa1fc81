//! Protocol gateway: HTTP boundary for the session transport.
//!
//! `before` validates headers and decodes the body into a message batch;
//! `after` drives the batch through a fresh [`SessionTransport`] and
//! assembles the HTTP response. The rate limit middleware wraps both hooks,
//! giving the control flow:
//!
//! ```text
//! request → rate_limit.before → gateway.before (parse)
//!         → gateway.after (drive transport) → rate_limit.after → response
//! ```
//!
//! Only protocol-shape errors are handled here (as structured 4xx with a
//! JSON-RPC envelope). Errors from the protocol server propagate to the
//! outer layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::ratelimit::RateLimitMiddleware;
use crate::transport::session::{BatchOutcome, ResponseSender, SessionTransport};
use crate::transport::{parse_body, JsonRpcMessage};

/// The protocol server seam.
///
/// The gateway dispatches every inbound message here, once per message,
/// regardless of type. Implementations answer requests through the
/// [`ResponseSender`], synchronously or from a spawned task; the sender is
/// cheap to clone and outlives the call.
pub trait MessageHandler: Send + Sync {
    /// Process one inbound message.
    fn handle(&self, message: JsonRpcMessage, replies: ResponseSender);
}

/// Validate headers and decode the body into a message batch.
///
/// `Accept` and `Content-Type` must each contain `application/json`,
/// case-insensitively and tolerant of parameter suffixes such as
/// `; charset=utf-8`. Header *names* are already normalized to lower-case
/// by the HTTP layer; values are lowered here before matching.
///
/// # Errors
///
/// - `NotAcceptable` (406) when `Accept` does not match
/// - `UnsupportedMediaType` (415) when `Content-Type` does not match
/// - `InvalidBody` (422) on any decode/parse/shape failure
pub fn before(headers: &HeaderMap, body: &Bytes) -> Result<Vec<JsonRpcMessage>, GatewayError> {
    if !header_contains_json(headers, header::ACCEPT) {
        return Err(GatewayError::NotAcceptable);
    }
    if !header_contains_json(headers, header::CONTENT_TYPE) {
        return Err(GatewayError::UnsupportedMediaType);
    }
    parse_body(body)
}

fn header_contains_json(headers: &HeaderMap, name: header::HeaderName) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("application/json"))
}

/// Drive a message batch through the protocol server and assemble the HTTP
/// response.
///
/// A fresh transport is created per invocation; its pending table is the
/// correlation scope for this batch alone. Pure-notification batches yield
/// the default 202 with an empty `text/plain` body; anything that produced
/// responses yields 200 with a JSON body. The default
/// `Content-Type: application/json` loses to any header the caller set.
pub async fn after(
    handler: &Arc<dyn MessageHandler>,
    messages: Vec<JsonRpcMessage>,
    caller_headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let transport = SessionTransport::new();
    let dispatch = {
        let handler = Arc::clone(handler);
        let sender = transport.sender();
        Arc::new(move |message: JsonRpcMessage| handler.handle(message, sender.clone()))
    };
    transport.set_on_message(dispatch);
    transport.start()?;

    let outcome = transport.handle_messages(messages).await?;
    transport.close();

    let mut response = match outcome {
        BatchOutcome::Empty => {
            debug!("notification-only batch, no response body");
            (
                StatusCode::ACCEPTED,
                [(header::CONTENT_TYPE, "text/plain")],
                String::new(),
            )
                .into_response()
        }
        BatchOutcome::Single(message) => json_response(serde_json::to_string(&message)),
        BatchOutcome::Batch(responses) => json_response(serde_json::to_string(&responses)),
    };

    // Caller-set headers win on conflict.
    for (name, value) in caller_headers.iter() {
        response.headers_mut().insert(name, value.clone());
    }
    Ok(response)
}

fn json_response(body: Result<String, serde_json::Error>) -> Response {
    match body {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        // Values round-trip from parsed JSON; serialization cannot fail in
        // practice, but a response is still owed if it does.
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("response serialization failed: {}", e),
        )
            .into_response(),
    }
}

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// The protocol server, constructed once at process start
    pub handler: Arc<dyn MessageHandler>,
    /// Rate limit hooks wrapping the gateway
    pub rate_limit: Arc<RateLimitMiddleware>,
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// One gateway invocation, hooks composed in order.
async fn handle_mcp(
    State(state): State<AppState>,
    connect_info: Result<ConnectInfo<SocketAddr>, axum::extract::rejection::ExtensionRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = Uuid::new_v4();
    let span = info_span!("mcp_invocation", %correlation_id);

    async move {
        let peer = connect_info.ok().map(|ConnectInfo(addr)| addr.ip());

        let rate_ctx = match state.rate_limit.before(&headers, &body, peer).await {
            Ok(ctx) => ctx,
            Err(denied) => return *denied,
        };

        let messages = match before(&headers, &body) {
            Ok(messages) => messages,
            Err(e) => return e.into_response(),
        };

        let mut response = match after(&state.handler, messages, HeaderMap::new()).await {
            Ok(response) => response,
            Err(e) => return e.into_response(),
        };

        state.rate_limit.after(&rate_ctx, &mut response).await;
        response
    }
    .instrument(span)
    .await
}
