//! Gateway error types and HTTP response mapping.
//!
//! Protocol-shape errors (bad headers, malformed bodies) are handled locally
//! and rendered as 4xx responses carrying a JSON-RPC error envelope. Anything
//! downstream of the protocol boundary propagates unchanged for an outer
//! error-handling layer to map to 5xx.

pub mod jsonrpc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub use jsonrpc::JsonRpcError;

/// Gateway-specific JSON-RPC error code used in all envelope-level failures.
pub const GATEWAY_ERROR_CODE: i32 = -32000;

/// Errors raised at the protocol boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// `Accept` header does not include `application/json`.
    #[error("Not Acceptable: Client must accept application/json")]
    NotAcceptable,

    /// `Content-Type` header does not include `application/json`.
    #[error("Unsupported Media Type: Content-Type must be application/json")]
    UnsupportedMediaType,

    /// Body failed to decode, parse, or validate as JSON-RPC.
    #[error("Invalid request body: {details}")]
    InvalidBody {
        /// What went wrong, safe for client consumption
        details: String,
    },

    /// `start()` called on a transport that is already started.
    #[error("transport already started")]
    AlreadyStarted,
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            GatewayError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            GatewayError::InvalidBody { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            // Transport misuse is a programming error, not a client fault.
            GatewayError::AlreadyStarted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let error = JsonRpcError::new(GATEWAY_ERROR_CODE, self.to_string());
        let body = jsonrpc::error_envelope(&error).to_string();
        (
            self.status(),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
