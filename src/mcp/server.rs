//! MCP Server implementation
//!
//! Line-delimited JSON-RPC over stdio. Requests are handled one at a time.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Result;
use crate::graph::client::GraphClient;
use crate::mcp::tools::ToolHandler;
use crate::mcp::types::*;

const SERVER_NAME: &str = "outlook";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// MCP Server for Outlook
pub struct McpServer {
    tool_handler: ToolHandler,
    initialized: bool,
}

impl McpServer {
    pub fn new(graph_client: Arc<GraphClient>) -> Self {
        Self {
            tool_handler: ToolHandler::new(graph_client),
            initialized: false,
        }
    }

    /// Whether the client has sent `notifications/initialized`
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Run the server on stdio until stdin closes
    pub async fn run_stdio(&mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            if let Some(response) = self.handle_message(&line).await {
                let mut response_str = serde_json::to_string(&response)?;
                response_str.push('\n');
                stdout.write_all(response_str.as_bytes()).await?;
                stdout.flush().await?;
            }
        }

        tracing::info!("stdin closed, shutting down");
        Ok(())
    }

    /// Handle one JSON-RPC message; notifications produce no response
    pub async fn handle_message(&mut self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("Unreadable message: {}", e);
                return Some(JsonRpcResponse::error(
                    None,
                    JsonRpcError::parse_error(e.to_string()),
                ));
            }
        };

        if request.is_notification() {
            if request.method == methods::INITIALIZED {
                self.initialized = true;
            } else {
                tracing::debug!("Ignoring notification {}", request.method);
            }
            return None;
        }

        let id = request.id.clone();
        let response = match request.method.as_str() {
            methods::INITIALIZE => to_response(id, &self.initialize_result()),
            methods::PING => JsonRpcResponse::success(id, serde_json::json!({})),
            methods::LIST_TOOLS => to_response(
                id,
                &ListToolsResult {
                    tools: self.tool_handler.list_tools(),
                },
            ),
            methods::CALL_TOOL => match call_params(&request) {
                Ok(params) => {
                    let result = self.tool_handler.call_tool(&params.name, params.arguments).await;
                    to_response(id, &result)
                }
                Err(e) => JsonRpcResponse::error(id, e),
            },
            _ => JsonRpcResponse::error(id, JsonRpcError::method_not_found(&request.method)),
        };
        Some(response)
    }

    fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: SERVER_VERSION.to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {}),
            },
        }
    }
}

fn call_params(request: &JsonRpcRequest) -> std::result::Result<CallToolParams, JsonRpcError> {
    let params = request
        .params
        .clone()
        .ok_or_else(|| JsonRpcError::invalid_params("Missing tool parameters"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid tool parameters: {}", e)))
}

fn to_response<T: serde::Serialize>(id: Option<RequestId>, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(e.to_string())),
    }
}
