//! JSON-RPC 2.0 wire protocol shared with provider processes.
//!
//! Requests and responses are newline-delimited JSON objects. Requests
//! carry a monotonically increasing correlation id per connection; the
//! matching response mirrors that id. Responses whose id matches no pending
//! request are logged and dropped.

pub mod client;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::{ClientEvent, ProtocolClient};

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request issued to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response read from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Mirrors the request id. May be absent or non-numeric on provider
    /// bugs; such frames are dropped.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A tool exposed by a provider, as reported by `tools/list`.
///
/// The manager replaces a provider's whole descriptor set on every
/// successful (re)connect; descriptor sets are never partially merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
    /// Owning provider, filled in by the client.
    #[serde(default)]
    pub provider_id: String,
}

/// Cost reported by a provider for one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub amount: Decimal,
    pub currency: String,
}

/// Outcome of a single tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
}

impl ToolResult {
    /// A successful result with the provider's payload.
    pub fn success(data: Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            cost: None,
        }
    }

    /// A failed result carrying the provider's error message.
    pub fn failure(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time_ms,
            cost: None,
        }
    }

    /// Attach a reported cost.
    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = Some(cost);
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = JsonRpcRequest::new(7, "tools/list", json!({}));
        let wire: Value = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list", "params": {}})
        );
    }

    #[test]
    fn test_response_with_error() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32000,"message":"boom"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, Some(json!(3)));
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32000);
    }

    #[test]
    fn test_tool_descriptor_accepts_camel_case_schema() {
        let raw = r#"{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}"#;
        let tool: ToolDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(tool.name, "echo");
        assert_eq!(tool.input_schema, json!({"type": "object"}));
    }
}
