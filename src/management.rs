//! C11: the gateway's own MCP server, exposing registry and capture-query
//! operations as MCP tools (spec.md §4.11). Mounted at `/gateway/mcp` and
//! alias `/g/mcp`, authenticated like every other proxied route. Grounded
//! on `ProxyService::process_jsonrpc`'s method-dispatch shape.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use turbomcp_protocol::types::CallToolRequest;

use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::storage::RecordQuery;

#[derive(Clone)]
pub struct ManagementState {
    pub gateway: Arc<Gateway>,
}

fn tool_list() -> Value {
    serde_json::json!({
        "tools": [
            {
                "name": "add_server",
                "description": "Register a new MCP server with the gateway",
                "inputSchema": {
                    "type": "object",
                    "properties": { "config": { "type": "object" } },
                    "required": ["config"]
                }
            },
            {
                "name": "remove_server",
                "description": "Deregister an MCP server",
                "inputSchema": {
                    "type": "object",
                    "properties": { "name": { "type": "string" } },
                    "required": ["name"]
                }
            },
            {
                "name": "list_servers",
                "description": "List every registered server and its runtime status",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "search_records",
                "description": "Search captured request, response, SSE, and error records",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "serverName": { "type": "string" },
                        "sessionId": { "type": "string" },
                        "method": { "type": "string" },
                        "limit": { "type": "integer" }
                    }
                }
            }
        ]
    })
}

fn invalid_params(id: Value, message: impl Into<String>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32602, "message": message.into() }
    })
}

fn method_not_found(id: Value, method: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32601, "message": format!("method not found: {method}") }
    })
}

fn success(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_result(id: Value, error: &GatewayError) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error.to_jsonrpc_error() })
}

/// `POST /gateway/mcp` and its `/g/mcp` alias.
pub async fn handle_management_request(State(state): State<ManagementState>, body: Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            let error = serde_json::json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": { "code": -32700, "message": "Parse error" }
            });
            return (StatusCode::BAD_REQUEST, Json(error)).into_response();
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

    let response = match method {
        "tools/list" => success(id, tool_list()),
        "tools/call" => handle_tool_call(&state, id, request.get("params").cloned()).await,
        other => method_not_found(id, other),
    };

    Json(response).into_response()
}

async fn handle_tool_call(state: &ManagementState, id: Value, params: Option<Value>) -> Value {
    let Some(params) = params else {
        return invalid_params(id, "missing params for tools/call");
    };
    let call: CallToolRequest = match serde_json::from_value(params) {
        Ok(call) => call,
        Err(e) => return invalid_params(id, format!("invalid tools/call params: {e}")),
    };

    let args = call.arguments.unwrap_or_default();
    match call.name.as_str() {
        "add_server" => add_server(state, id, args).await,
        "remove_server" => remove_server(state, id, args).await,
        "list_servers" => list_servers(state, id).await,
        "search_records" => search_records(state, id, args).await,
        other => invalid_params(id, format!("unknown tool: {other}")),
    }
}

async fn add_server(state: &ManagementState, id: Value, args: HashMap<String, Value>) -> Value {
    let Some(config_value) = args.get("config").cloned() else {
        return invalid_params(id, "missing \"config\"");
    };
    let config: ServerConfig = match serde_json::from_value(config_value) {
        Ok(config) => config,
        Err(e) => return invalid_params(id, format!("invalid server config: {e}")),
    };

    match state.gateway.add_server(config).await {
        Ok(()) => success(id, serde_json::json!({ "ok": true })),
        Err(e) => error_result(id, &e),
    }
}

async fn remove_server(state: &ManagementState, id: Value, args: HashMap<String, Value>) -> Value {
    let Some(name) = args.get("name").and_then(Value::as_str) else {
        return invalid_params(id, "missing \"name\"");
    };

    match state.gateway.remove_server(name).await {
        Ok(()) => success(id, serde_json::json!({ "ok": true })),
        Err(e) => error_result(id, &e),
    }
}

async fn list_servers(state: &ManagementState, id: Value) -> Value {
    match state.gateway.list_servers().await {
        Ok(servers) => success(id, serde_json::json!({ "servers": servers })),
        Err(e) => error_result(id, &e),
    }
}

async fn search_records(state: &ManagementState, id: Value, args: HashMap<String, Value>) -> Value {
    let query = RecordQuery {
        server_name: args.get("serverName").and_then(Value::as_str).map(str::to_string),
        session_id: args.get("sessionId").and_then(Value::as_str).map(str::to_string),
        method: args.get("method").and_then(Value::as_str).map(str::to_string),
        limit: args.get("limit").and_then(Value::as_u64).map(|n| n as usize).unwrap_or(0),
    };

    match state.gateway.storage().query_records(query).await {
        Ok(records) => success(id, serde_json::json!({ "records": records })),
        Err(e) => error_result(id, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn config(storage_dir: std::path::PathBuf) -> GatewayConfig {
        GatewayConfig {
            storage_dir,
            bind: "127.0.0.1".to_string(),
            port: 0,
            auth_token: secrecy::SecretString::from("test-token".to_string()),
            isolated_session_cap: GatewayConfig::DEFAULT_ISOLATED_CAP,
            max_body_bytes: GatewayConfig::DEFAULT_MAX_BODY_BYTES,
        }
    }

    async fn state() -> ManagementState {
        let dir = tempfile::tempdir().unwrap();
        ManagementState { gateway: Gateway::init(config(dir.path().to_path_buf())).await.unwrap() }
    }

    #[test]
    fn tools_list_enumerates_all_four_tools() {
        let response = success(Value::from(1), tool_list());
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 4);
    }

    #[tokio::test]
    async fn add_server_then_list_servers_round_trips() {
        let state = state().await;
        let args = HashMap::from([(
            "config".to_string(),
            serde_json::json!({ "type": "http", "name": "demo", "url": "http://127.0.0.1:1/mcp" }),
        )]);
        let response = add_server(&state, Value::from(1), args).await;
        assert!(response.get("error").is_none(), "unexpected error: {response:?}");

        let response = list_servers(&state, Value::from(2)).await;
        let servers = response["result"]["servers"].as_array().unwrap();
        assert_eq!(servers.len(), 1);
    }

    #[tokio::test]
    async fn add_server_without_config_is_invalid_params() {
        let state = state().await;
        let response = add_server(&state, Value::from(1), HashMap::new()).await;
        assert_eq!(response["error"]["code"], serde_json::json!(-32602));
    }

    #[tokio::test]
    async fn remove_server_unknown_name_is_surfaced_as_error() {
        let state = state().await;
        let response = remove_server(&state, Value::from(1), HashMap::from([("name".to_string(), Value::from("nope"))])).await;
        assert!(response.get("error").is_some());
    }

    #[tokio::test]
    async fn search_records_with_no_filters_returns_everything_captured() {
        let state = state().await;
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        state.gateway.capture().on_request("demo", "stateless", &request).await;

        let response = search_records(&state, Value::from(1), HashMap::new()).await;
        let records = response["result"]["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
    }
}
