//! JSON-RPC 2.0 message types for the tool-calling surface.
//!
//! One JSON object per line in each direction. Requests carry an `id` that
//! must be echoed verbatim in the reply, so ids are kept as raw JSON values
//! rather than forced into one scalar type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `error.code` for unparseable request lines.
pub const PARSE_ERROR: i64 = -32700;
/// `error.code` for structurally invalid requests.
pub const INVALID_REQUEST: i64 = -32600;
/// `error.code` for unknown methods.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// `error.code` for invalid or missing parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// `error.code` for requests arriving before `initialize`.
pub const NOT_INITIALISED: i64 = -32002;

/// Protocol revision reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// An inbound JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Protocol version marker; tolerated but not validated strictly.
    #[serde(default)]
    pub jsonrpc: String,
    /// Request identifier. Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    /// Reports whether this message is a notification (no reply expected).
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Returns a named parameter, if present.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|params| params.get(name))
    }
}

/// An outbound JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Identifier of the request this answers; `null` when unknowable.
    pub id: Value,
    /// The result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

impl Response {
    /// Creates a success response echoing `id`.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response echoing `id`.
    #[must_use]
    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_owned(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}
