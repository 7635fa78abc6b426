//! JSON-RPC 2.0 message types.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code for requests rejected by parameter validation.
pub const CODE_VALIDATION: i64 = 400;

/// Error code for structural misuse of the calling API.
pub const CODE_CRITICAL_INTERNAL: i64 = 500;

/// Error code reported when a downstream dependency refused the connection.
pub const CODE_INTERNAL_SERVER: i64 = 1001;

/// Thread-safe request ID generator.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generates a unique request ID.
///
/// IDs are monotonically increasing and thread-safe.
#[must_use]
pub fn next_request_id() -> i64 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Unique request identifier.
    pub id: i64,
    /// The method to invoke.
    pub method: String,
    /// Call parameters; the framework requires a JSON object here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Creates a new request with an auto-generated ID.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::with_id(next_request_id(), method, params)
    }

    /// Creates a new request with a specific ID.
    #[must_use]
    pub fn with_id(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version.
    pub jsonrpc: String,
    /// Request identifier this response corresponds to.
    pub id: Option<i64>,
    /// The result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcResponse {
    /// Builds a success envelope.
    #[must_use]
    pub fn success(id: Option<i64>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error envelope.
    ///
    /// The error payload is kept as a raw [`Value`] because remote peers are
    /// allowed to return non-standard error shapes, which the caller-side
    /// classification inspects without losing information.
    #[must_use]
    pub fn failure(id: Option<i64>, error: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// The canonical error object produced by this framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code; see the reserved code constants.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Builds an error object with the given code and message.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Serialises the error object for embedding in a response envelope.
    #[must_use]
    pub fn into_value(self) -> Value {
        serde_json::to_value(&self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn serialises_request_with_params() {
        let request = RpcRequest::new("users.create", Some(json!({"name": "ada"})));
        let json = serde_json::to_string(&request).expect("serialize request");

        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""method":"users.create""#));
        assert!(json.contains(&format!(r#""id":{}"#, request.id)));
        assert!(json.contains(r#""params""#));
    }

    #[rstest]
    fn serialises_request_without_params() {
        let request = RpcRequest::with_id(42, "_ping", None);
        let json = serde_json::to_string(&request).expect("serialize request");

        assert!(json.contains(r#""id":42"#));
        assert!(json.contains(r#""method":"_ping""#));
        assert!(!json.contains("params"));
    }

    #[rstest]
    fn request_round_trips_through_serde() {
        let request = RpcRequest::with_id(7, "orders.list", Some(json!({"page": 2})));
        let encoded = serde_json::to_vec(&request).expect("encode");
        let decoded: RpcRequest = serde_json::from_slice(&encoded).expect("decode");

        assert_eq!(decoded.method, "orders.list");
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.params, Some(json!({"page": 2})));
    }

    #[rstest]
    fn deserialises_success_response() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"status":"OK"}}"#;
        let response: RpcResponse = serde_json::from_str(json).expect("parse response");

        assert_eq!(response.id, Some(1));
        assert!(response.result.is_some());
        assert!(response.error.is_none());
    }

    #[rstest]
    fn deserialises_error_response_with_nonstandard_error() {
        let json = r#"{"jsonrpc":"2.0","id":3,"error":"boom"}"#;
        let response: RpcResponse = serde_json::from_str(json).expect("parse response");

        assert_eq!(response.error, Some(json!("boom")));
    }

    #[rstest]
    fn error_object_embeds_as_value() {
        let error = RpcError::new(CODE_VALIDATION, "params.name is required");
        let value = error.into_value();

        assert_eq!(value["code"], json!(400));
        assert_eq!(value["message"], json!("params.name is required"));
    }

    #[rstest]
    fn request_ids_are_unique() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }
}
