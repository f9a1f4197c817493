use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::catalog::ObjectType;
use crate::error::GuardError;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }

    /// Error response for a guarded request; `data.kind` carries the stable
    /// failure name.
    pub fn guard_error(id: Option<Value>, err: &GuardError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: err.code(),
                message: err.to_string(),
                data: Some(json!({ "kind": err.kind() })),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub initialization_options: Option<InitializationOptions>,
}

#[derive(Debug, Deserialize)]
pub struct InitializationOptions {
    pub settings: Option<ServerSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    pub database_url: Option<String>,
}

// MCP specific structures
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Serialize)]
pub struct ServerCapabilities {
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Serialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolsList {
    pub tools: Vec<Tool>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct QueryArguments {
    pub query: String,
    pub database: Option<String>,
}

/// Arguments shared by the catalog tools. Object names arrive under the name
/// each tool advertises (`table_name`, `view_name`, …).
#[derive(Debug, Default, Deserialize)]
pub struct CatalogArguments {
    pub database: Option<String>,
    pub schema: Option<String>,
    #[serde(
        alias = "table_name",
        alias = "view_name",
        alias = "procedure_name",
        alias = "function_name"
    )]
    pub name: Option<String>,
    pub pattern: Option<String>,
    #[serde(default)]
    pub include_system: bool,
    #[serde(default)]
    pub object_types: Vec<ObjectType>,
    pub rows: Option<usize>,
    #[serde(default)]
    pub random: bool,
}
