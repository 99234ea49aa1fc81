//! JSON-RPC 2.0 message model and body parsing.
//!
//! Messages are kept as parsed `serde_json::Value`s with validated shape
//! rather than fully-typed structs: the gateway never interprets `params`
//! or `result`, it only classifies messages and correlates ids.
//!
//! # JSON-RPC 2.0 Compliance
//!
//! - Requests have `id` and `method`
//! - Notifications have `method` but no `id`
//! - Responses have `id` plus `result` or `error`, no `method`
//! - `id` type (string, integer, or null) is preserved exactly

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::GatewayError;

/// JSON-RPC 2.0 request ID.
///
/// JSON-RPC 2.0 allows string or integer IDs. The exact type is preserved so
/// that responses correlate with requests without coercion: if the client
/// sends `"id": 1`, the matching response carries `"id": 1`, never `"id": "1"`.
///
/// `"id": null` is valid (though unusual) and distinct from a missing `id`
/// field, which marks a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    /// Integer ID (e.g., `"id": 1`)
    Number(i64),
    /// String ID (e.g., `"id": "abc-123"`)
    String(String),
    /// Explicit null ID
    Null,
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_id(&value).map_err(|_| {
            serde::de::Error::custom("JSON-RPC ID must be string, integer, or null")
        })
    }
}

/// Parse a JSON value into a `JsonRpcId`.
///
/// Accepts string, integer, or null. Rejects floats, booleans, arrays, objects.
fn parse_id(value: &Value) -> Result<JsonRpcId, ()> {
    match value {
        Value::Number(n) => n.as_i64().map(JsonRpcId::Number).ok_or(()),
        Value::String(s) => Ok(JsonRpcId::String(s.clone())),
        Value::Null => Ok(JsonRpcId::Null),
        _ => Err(()),
    }
}

/// Classification of a JSON-RPC 2.0 message.
///
/// Determined by presence/absence of `id` and `method`:
/// - Request: has both `id` and `method`
/// - Notification: has `method` but no `id`
/// - Response: has `id` but no `method`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Expects a correlated response.
    Request,
    /// Fire-and-forget; no response expected.
    Notification,
    /// A response to a previous request.
    Response,
}

/// A shape-validated JSON-RPC 2.0 message.
///
/// Wraps the original parsed value so re-serialization is byte-faithful to
/// what the client or protocol server produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JsonRpcMessage {
    raw: Value,
}

impl JsonRpcMessage {
    /// Validate a parsed JSON value as a JSON-RPC 2.0 message.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidBody` if the value is not an object,
    /// the `jsonrpc` field is missing or not `"2.0"`, the `id` field is not
    /// a valid JSON-RPC ID, or the message has neither `id` nor `method`.
    pub fn try_from_value(value: Value) -> Result<Self, GatewayError> {
        let obj = value.as_object().ok_or_else(|| GatewayError::InvalidBody {
            details: "message must be a JSON object".to_string(),
        })?;

        let version = obj.get("jsonrpc").and_then(|v| v.as_str());
        if version != Some("2.0") {
            return Err(GatewayError::InvalidBody {
                details: "missing or invalid jsonrpc version field".to_string(),
            });
        }

        if let Some(id) = obj.get("id") {
            parse_id(id).map_err(|_| GatewayError::InvalidBody {
                details: "id must be a string, integer, or null".to_string(),
            })?;
        }

        let has_method = obj.get("method").is_some_and(|m| m.is_string());
        if obj.get("method").is_some() && !has_method {
            return Err(GatewayError::InvalidBody {
                details: "method must be a string".to_string(),
            });
        }

        if obj.get("id").is_none() && !has_method {
            return Err(GatewayError::InvalidBody {
                details: "message has neither id nor method".to_string(),
            });
        }

        Ok(Self { raw: value })
    }

    /// Build a request message.
    pub fn request(id: JsonRpcId, method: &str, params: Option<Value>) -> Self {
        let mut obj = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params {
            obj["params"] = params;
        }
        Self { raw: obj }
    }

    /// Build a notification message.
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        let mut obj = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            obj["params"] = params;
        }
        Self { raw: obj }
    }

    /// Build a success response message.
    pub fn response(id: JsonRpcId, result: Value) -> Self {
        Self {
            raw: serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
        }
    }

    /// Build an error response message.
    pub fn error_response(id: JsonRpcId, code: i32, message: &str) -> Self {
        Self {
            raw: serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
        }
    }

    /// The message's `id`, if present. Type is preserved exactly.
    pub fn id(&self) -> Option<JsonRpcId> {
        self.raw.get("id").and_then(|v| parse_id(v).ok())
    }

    /// The message's `method`, if present.
    pub fn method(&self) -> Option<&str> {
        self.raw.get("method").and_then(|v| v.as_str())
    }

    /// The message's `params`, if present.
    pub fn params(&self) -> Option<&Value> {
        self.raw.get("params")
    }

    /// Classify this message by its `id`/`method` fields.
    pub fn kind(&self) -> MessageKind {
        match (self.raw.get("id").is_some(), self.method().is_some()) {
            (true, true) => MessageKind::Request,
            (false, true) => MessageKind::Notification,
            // Shape validation guarantees at least one of id/method.
            (true, false) | (false, false) => MessageKind::Response,
        }
    }

    /// Returns true if this message expects a correlated response.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.kind() == MessageKind::Request
    }

    /// The underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.raw
    }
}

/// Decode and parse an HTTP body into a batch of JSON-RPC messages.
///
/// Bodies are either raw JSON or base64-encoded JSON (serverless invocation
/// payloads deliver the latter): if the first non-whitespace byte opens a
/// JSON object or array the body is parsed directly, otherwise one base64
/// decode is attempted first. A bare object is wrapped into a one-element
/// batch. Every element must pass JSON-RPC shape validation.
///
/// # Errors
///
/// Returns `GatewayError::InvalidBody` on decode, parse, or shape failure.
pub fn parse_body(body: &[u8]) -> Result<Vec<JsonRpcMessage>, GatewayError> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace());

    let decoded;
    let json_bytes: &[u8] = match first {
        Some(b'{') | Some(b'[') => body,
        Some(_) => {
            let trimmed: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            decoded = base64::engine::general_purpose::STANDARD
                .decode(&trimmed)
                .map_err(|e| GatewayError::InvalidBody {
                    details: format!("body is neither JSON nor base64: {}", e),
                })?;
            &decoded
        }
        None => {
            return Err(GatewayError::InvalidBody {
                details: "empty body".to_string(),
            })
        }
    };

    let value: Value =
        serde_json::from_slice(json_bytes).map_err(|e| GatewayError::InvalidBody {
            details: format!("invalid JSON: {}", e),
        })?;

    let elements = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => {
            return Err(GatewayError::InvalidBody {
                details: "body must be a JSON object or array".to_string(),
            })
        }
    };

    elements
        .into_iter()
        .map(JsonRpcMessage::try_from_value)
        .collect()
}
