use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::config::{redact_url, Config};
use crate::db::{connect_with_retry, describe_driver_error, MySqlConnector};
use crate::error::ToolError;
use crate::executor::Connector;
use crate::rpc::{
    InitializeParams,
    InitializeResult,
    JsonRpcRequest,
    JsonRpcResponse,
    ServerCapabilities,
    ServerInfo,
    ToolCallParams,
    ToolsCapability,
    ToolsList,
};
use crate::service::QueryService;
use crate::tools;

const PROTOCOL_VERSION: &str = "2025-03-26";

type MySqlService = QueryService<MySqlConnector>;

/// Connects the pool and assembles the guarded query pipeline. `url`
/// overrides the configured connection target.
pub async fn connect_service(config: &Config, url: Option<&str>) -> Result<MySqlService, String> {
    let options = config.connect_options(url).map_err(|e| e.to_string())?;
    let bounds = config.execution_bounds().map_err(|e| e.to_string())?;
    let pool = connect_with_retry(options, config.max_connections)
        .await
        .map_err(|e| describe_driver_error(&e))?;
    let connector = MySqlConnector::new(pool, bounds.timeout());
    Ok(QueryService::new(
        connector,
        bounds,
        config.access_policy(),
        config.database.clone(),
    ))
}

/// Connects, runs `SELECT 1` through the full pipeline and reports the outcome.
pub async fn health_check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Running health check against {}", config.describe_target());
    let service = connect_service(config, None).await?;
    let result = service.validate_and_execute("SELECT 1", None).await?;
    info!(
        "Health check passed: {} row(s) in {:?}",
        result.row_count(),
        result.elapsed
    );
    Ok(())
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut service: Option<Arc<MySqlService>> = None;

    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    // Tool calls run concurrently; every response goes through one writer.
    let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    let writer = tokio::spawn(write_responses(rx));

    info!("MCP MySQL read-only server started and ready to accept connections");
    info!(
        "Server config: target={}, max_rows={}, query_timeout={:?}, allowed={:?}, blocked={:?}",
        config.describe_target(),
        config.max_rows,
        config.query_timeout,
        config.allowed_databases,
        config.blocked_databases
    );
    info!("Server PID: {}", std::process::id());

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }

                debug!("Received message (len={})", line.len());
                let request = match serde_json::from_str::<JsonRpcRequest>(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("Failed to parse request: {e}");
                        let _ = tx.send(JsonRpcResponse::error(None, -32700, "Parse error".to_string()));
                        continue;
                    }
                };
                debug!("Parsed request: method={}, id={:?}", request.method, request.id);

                // Notifications get no response.
                if request.method.starts_with("notifications/") || request.method == "initialized" {
                    debug!("Received notification: {}", request.method);
                    continue;
                }

                match request.method.as_str() {
                    "initialize" => {
                        let response = initialize(request, &config, &mut service).await;
                        let _ = tx.send(response);
                    }
                    "tools/call" => match &service {
                        Some(svc) => {
                            let svc = Arc::clone(svc);
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                let response = handle_tool_call(&svc, request.id, request.params).await;
                                let _ = tx.send(response);
                            });
                        }
                        None => {
                            let _ = tx.send(JsonRpcResponse::error(
                                request.id,
                                -32002,
                                "Server not initialized".to_string(),
                            ));
                        }
                    },
                    _ => {
                        let _ = tx.send(handle_request(request, config.max_rows));
                    }
                }
            }
            Ok(None) => {
                info!("stdin closed - client disconnected, shutting down server");
                break;
            }
            Err(e) => {
                warn!("Error reading from stdin: {e} (error kind: {:?})", e.kind());
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    info!("Unexpected EOF - client may have terminated");
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }
        }
    }

    // In-flight tool calls hold sender clones; the writer drains them first.
    drop(tx);
    if let Err(e) = writer.await {
        error!("Response writer task failed: {e}");
    }
    info!("MCP MySQL read-only server shutdown complete");
    Ok(())
}

async fn write_responses(mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>) {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = rx.recv().await {
        let response_str = match serde_json::to_string(&response) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize response: {e}");
                let fallback = JsonRpcResponse::error(response.id, -32603, "Internal error".to_string());
                match serde_json::to_string(&fallback) {
                    Ok(s) => s,
                    Err(_) => continue,
                }
            }
        };
        if let Err(e) = write_response(&mut stdout, &response_str).await {
            error!("Failed to write response: {e}");
        }
    }
}

async fn write_response(stdout: &mut tokio::io::Stdout, response: &str) -> std::io::Result<()> {
    stdout.write_all(response.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn initialize(
    request: JsonRpcRequest,
    config: &Config,
    service: &mut Option<Arc<MySqlService>>,
) -> JsonRpcResponse {
    debug!("Handling initialize request");

    let url_from_opts = request
        .params
        .as_ref()
        .and_then(|params| serde_json::from_value::<InitializeParams>(params.clone()).ok())
        .and_then(|opts| opts.initialization_options)
        .and_then(|init_opts| init_opts.settings)
        .and_then(|settings| settings.database_url);

    match &url_from_opts {
        Some(url) => info!("Using database_url from initializationOptions: {}", redact_url(url)),
        None => info!("Using database target from config: {}", config.describe_target()),
    }

    if service.is_none() || url_from_opts.is_some() {
        info!("Attempting database connection...");
        match connect_service(config, url_from_opts.as_deref()).await {
            Ok(svc) => {
                info!("Database connection successful!");
                *service = Some(Arc::new(svc));
            }
            Err(message) => {
                error!("Database connection failed: {message}");
                return JsonRpcResponse::error(
                    request.id,
                    -32001,
                    format!("Database connection failed: {message}"),
                );
            }
        }
    }

    JsonRpcResponse::success(request.id, initialize_result())
}

fn initialize_result() -> Value {
    json!(InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: false,
            }),
        },
        server_info: ServerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    })
}

/// Methods that need no database connection.
fn handle_request(request: JsonRpcRequest, max_rows: usize) -> JsonRpcResponse {
    match request.method.as_str() {
        "tools/list" => {
            debug!("Listing available tools");
            let tools = tools::tool_definitions(max_rows);
            JsonRpcResponse::success(request.id, json!(ToolsList { tools }))
        }
        "ping" => JsonRpcResponse::success(request.id, json!({})),
        _ => {
            warn!("Unknown method: {}", request.method);
            JsonRpcResponse::error(request.id, -32601, format!("Method not found: {}", request.method))
        }
    }
}

async fn handle_tool_call<C: Connector>(
    service: &QueryService<C>,
    id: Option<Value>,
    params: Option<Value>,
) -> JsonRpcResponse {
    let Some(params) = params else {
        return JsonRpcResponse::error(id, -32602, "Missing parameters".to_string());
    };
    let call = match serde_json::from_value::<ToolCallParams>(params) {
        Ok(call) => call,
        Err(e) => {
            return JsonRpcResponse::error(id, -32602, format!("Invalid tool call parameters: {e}"));
        }
    };

    match tools::call_tool(service, &call.name, call.arguments).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(ToolError::UnknownTool(name)) => {
            JsonRpcResponse::error(id, -32601, format!("Unknown tool: {name}"))
        }
        Err(e @ ToolError::InvalidArguments(_)) => JsonRpcResponse::error(id, -32602, e.to_string()),
        Err(ToolError::Guard(e)) => {
            if e.is_rejection() {
                warn!("Tool '{}' rejected: {} ({e})", call.name, e.kind());
            } else {
                warn!("Tool '{}' failed: {e}", call.name);
            }
            JsonRpcResponse::guard_error(id, &e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::access::AccessPolicy;
    use crate::executor::testing::FakeConnector;
    use crate::executor::ExecutionBounds;

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    fn service() -> QueryService<FakeConnector> {
        let bounds = ExecutionBounds::new(10, Duration::from_secs(5)).unwrap();
        QueryService::new(FakeConnector::with_rows(2), bounds, AccessPolicy::new(["Sales"], ["HR"]), "Sales")
    }

    #[test]
    fn test_tools_list_and_unknown_method() {
        let response = handle_request(request("tools/list", None), 100);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["result"]["tools"].as_array().unwrap().len(), 19);

        let response = handle_request(request("resources/list", None), 100);
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[test]
    fn test_initialize_result_shape() {
        let value = initialize_result();
        assert_eq!(value["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(value["serverInfo"]["name"], json!("mcp-server-mysql-readonly"));
    }

    #[tokio::test]
    async fn test_tool_call_success() {
        let svc = service();
        let params = json!({"name": "execute_query", "arguments": {"query": "SELECT id FROM t"}});
        let response = handle_tool_call(&svc, Some(json!(3)), Some(params)).await;
        assert!(response.error.is_none());
        assert_eq!(response.id, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_tool_call_errors_carry_kind() {
        let svc = service();
        let params = json!({"name": "execute_query", "arguments": {"query": "SELECT 1", "database": "HR"}});
        let response = handle_tool_call(&svc, Some(json!(4)), Some(params)).await;
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["code"], json!(-32007));
        assert_eq!(value["error"]["data"]["kind"], json!("DATABASE_NOT_ALLOWED"));

        let params = json!({"name": "execute_query", "arguments": {"query": "SELECT 1; SELECT 2"}});
        let response = handle_tool_call(&svc, Some(json!(5)), Some(params)).await;
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["data"]["kind"], json!("MULTIPLE_STATEMENTS"));

        let response = handle_tool_call(&svc, Some(json!(6)), None).await;
        assert_eq!(response.error.unwrap().code, -32602);

        let params = json!({"name": "nope", "arguments": {}});
        let response = handle_tool_call(&svc, Some(json!(7)), Some(params)).await;
        assert_eq!(response.error.unwrap().code, -32601);
    }
}
