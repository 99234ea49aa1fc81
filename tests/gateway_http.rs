//! End-to-end gateway tests: HTTP request in, JSON-RPC response out.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use tradegate::gateway::{self, AppState, MessageHandler};
use tradegate::ratelimit::{MemoryStore, RateLimiter, RateLimitMiddleware};
use tradegate::transport::{JsonRpcId, JsonRpcMessage, ResponseSender};

/// Protocol server double: echoes each request's method back in its result,
/// from a spawned task with a small inverted delay so batched responses
/// arrive out of order.
struct StaggeredEchoHandler;

impl MessageHandler for StaggeredEchoHandler {
    fn handle(&self, message: JsonRpcMessage, replies: ResponseSender) {
        if !message.is_request() {
            return;
        }
        let Some(id) = message.id() else { return };
        let delay = match &id {
            JsonRpcId::Number(n) => Duration::from_millis(40u64.saturating_sub(*n as u64 * 10)),
            _ => Duration::ZERO,
        };
        let method = message.method().unwrap_or_default().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            replies.send(JsonRpcMessage::response(id, json!({"method": method})));
        });
    }
}

fn app() -> Router {
    let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())));
    let state = AppState {
        handler: Arc::new(StaggeredEchoHandler),
        rate_limit: Arc::new(RateLimitMiddleware::new(limiter).expose_headers(true)),
    };
    gateway::router(state)
}

fn mcp_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::ACCEPT, "application/json")
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn single_request_round_trip() {
    let response = app()
        .oneshot(mcp_request(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
    assert!(response.headers().contains_key("x-ratelimit-limit"));

    let body = body_json(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["method"], "ping");
}

#[tokio::test]
async fn batch_responses_follow_request_order() {
    // Handler delays make id 1 resolve last; output order must still be 1, 2, 3.
    let body = r#"[
        {"jsonrpc":"2.0","id":1,"method":"a"},
        {"jsonrpc":"2.0","id":2,"method":"b"},
        {"jsonrpc":"2.0","method":"note"},
        {"jsonrpc":"2.0","id":3,"method":"c"}
    ]"#;
    let response = app().oneshot(mcp_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let responses = body.as_array().expect("array body");
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[1]["id"], 2);
    assert_eq!(responses[2]["id"], 3);
}

#[tokio::test]
async fn notification_only_batch_returns_202_empty() {
    let response = app()
        .oneshot(mcp_request(r#"{"jsonrpc":"2.0","method":"initialized"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/plain")
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn missing_accept_header_is_406_with_envelope() {
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    let body = body_json(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["error"]["code"], -32000);
    assert!(body["id"].is_null());
}

#[tokio::test]
async fn wrong_content_type_is_415() {
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::ACCEPT, "application/json")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32000);
}

#[tokio::test]
async fn malformed_body_is_422() {
    let response = app().oneshot(mcp_request(r#"{"broken"#)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32000);
}

#[tokio::test]
async fn invalid_jsonrpc_shape_is_422() {
    let response = app()
        .oneshot(mcp_request(r#"{"method":"missing_version"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn base64_encoded_body_is_accepted() {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(br#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#);
    let response = app().oneshot(mcp_request(&encoded)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], 9);
}

#[tokio::test]
async fn healthz_is_ok() {
    let request = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
