//! JSON-RPC 2.0 envelope types and error codes (spec.md §6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Validate envelope shape per spec.md §4.7: `jsonrpc="2.0"`, `id`
    /// string-or-number (or absent for notifications), `method` non-empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"".to_string());
        }
        if self.method.is_empty() {
            return Err("method must be non-empty".to_string());
        }
        if let Some(id) = &self.id {
            if !id.is_string() && !id.is_number() {
                return Err("id must be a string or number".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const TRAIL_NOT_FOUND: i64 = -32001;
    pub const SCENT_NOT_FOUND: i64 = -32002;
    pub const PAYLOAD_VALIDATION_FAILED: i64 = -32003;
    pub const RATE_LIMITED: i64 = -32004;
    pub const UNAUTHORIZED: i64 = -32005;
    pub const INVALID_CONDITION: i64 = -32006;
}

/// Notification sent server→client over SSE: `{jsonrpc, method: "sbp/trigger", params}`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: serde_json::Value,
}

impl JsonRpcNotification {
    pub fn trigger(params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "sbp/trigger",
            params,
        }
    }
}
