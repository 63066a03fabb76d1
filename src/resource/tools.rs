//! Minimal MCP tool endpoint spoken over JSON-RPC 2.0.
//!
//! Only what a protected resource needs to demonstrate authorization:
//! `initialize`, `tools/list` and `tools/call` with a single `get_time`
//! tool.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::verifier::AccessTokenInfo;

/// Protocol revision reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Lifecycle: client sends `initialize` to open a session.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Keepalive ping.
pub const METHOD_PING: &str = "ping";
/// Request the available tools.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Invoke a named tool.
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Method not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid params.
pub const INVALID_PARAMS: i64 = -32602;
/// Invalid request.
pub const INVALID_REQUEST: i64 = -32600;

/// The one tool this server exposes.
pub const GET_TIME: &str = "get_time";

/// A JSON-RPC 2.0 request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 response object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Mirrors the request `id`.
    pub id: Value,
    /// Successful result; mutually exclusive with `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object; mutually exclusive with `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// Handles one request from an authenticated caller.
///
/// Returns `None` for notifications, which get no response body.
pub fn dispatch(request: JsonRpcRequest, caller: &AccessTokenInfo) -> Option<JsonRpcResponse> {
    let id = request.id?;

    if request.jsonrpc != "2.0" {
        return Some(JsonRpcResponse::err(
            id,
            INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }

    tracing::debug!(method = %request.method, client_id = %caller.client_id, "JSON-RPC request");

    let response = match request.method.as_str() {
        METHOD_INITIALIZE => JsonRpcResponse::ok(id, initialize_result()),
        METHOD_PING => JsonRpcResponse::ok(id, json!({})),
        METHOD_TOOLS_LIST => JsonRpcResponse::ok(id, json!({ "tools": [get_time_tool()] })),
        METHOD_TOOLS_CALL => {
            let name = request
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str);
            match name {
                Some(GET_TIME) => {
                    tracing::info!(client_id = %caller.client_id, tool = GET_TIME, "Tool called");
                    JsonRpcResponse::ok(id, tool_result(get_time()))
                }
                Some(other) => {
                    JsonRpcResponse::err(id, INVALID_PARAMS, format!("unknown tool: {other}"))
                }
                None => JsonRpcResponse::err(id, INVALID_PARAMS, "missing tool name"),
            }
        }
        other => JsonRpcResponse::err(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
    };
    Some(response)
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": "gatehouse",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "get time",
    })
}

fn get_time_tool() -> Value {
    json!({
        "name": GET_TIME,
        "description": "Get the current server time.",
        "inputSchema": { "type": "object", "properties": {} },
    })
}

/// Current server time in several renderings.
pub fn get_time() -> Value {
    let now = Utc::now();
    json!({
        "current_time": now.to_rfc3339(),
        "timezone": "UTC",
        "timestamp": now.timestamp(),
        "formatted": now.format("%Y-%m-%d %H:%M:%S").to_string(),
    })
}

fn tool_result(value: Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "structuredContent": value,
        "isError": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> AccessTokenInfo {
        AccessTokenInfo {
            token: "t".to_string(),
            client_id: "c".to_string(),
            scopes: vec!["user".to_string()],
            expires_at: None,
            resource: None,
        }
    }

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_initialize_reports_protocol_version() {
        let resp = dispatch(request("initialize", None), &caller()).unwrap();
        assert_eq!(resp.result.unwrap()["protocolVersion"], PROTOCOL_VERSION);
    }

    #[test]
    fn test_tools_list_contains_get_time() {
        let resp = dispatch(request("tools/list", None), &caller()).unwrap();
        assert_eq!(resp.result.unwrap()["tools"][0]["name"], GET_TIME);
    }

    #[test]
    fn test_get_time_call() {
        let resp = dispatch(
            request("tools/call", Some(json!({"name": "get_time", "arguments": {}}))),
            &caller(),
        )
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["structuredContent"]["timezone"], "UTC");
        assert!(result["structuredContent"]["timestamp"].is_i64());
    }

    #[test]
    fn test_unknown_tool_is_invalid_params() {
        let resp = dispatch(
            request("tools/call", Some(json!({"name": "rm_rf"}))),
            &caller(),
        )
        .unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn test_unknown_method() {
        let resp = dispatch(request("resources/list", None), &caller()).unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_notification_gets_no_response() {
        let mut req = request("notifications/initialized", None);
        req.id = None;
        assert!(dispatch(req, &caller()).is_none());
    }
}
