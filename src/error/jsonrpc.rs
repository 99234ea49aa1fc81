//! JSON-RPC 2.0 error response structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 error object.
///
/// Embedded in the error envelopes the gateway returns for protocol-shape
/// failures (bad headers, malformed bodies) and rate-limit denials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (standard JSON-RPC or gateway-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object with no additional data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Build a full JSON-RPC error envelope: `{jsonrpc, error, id}`.
///
/// The `id` is `null` for envelope-level failures where no request id
/// could be determined (parse errors, header rejections).
pub fn error_envelope(error: &JsonRpcError) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "error": {
            "code": error.code,
            "message": error.message,
        },
        "id": Value::Null,
    })
}
