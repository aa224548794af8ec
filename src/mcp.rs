//! MCP (Model Context Protocol) Server
//!
//! Manual JSON-RPC 2.0 over stdio, one JSON document per line.
//!
//! # Methods
//!
//! - `initialize`, `ping`
//! - `tools/list` - every enabled tool, deduplicated by name
//! - `tools/call` - run a tool against a source
//! - `resources/list`, `resources/templates/list`, `resources/read`
//! - `notifications/*` - accepted, never answered
//!
//! Tool failures are returned as `isError: true` content holding an
//! [`ErrorEnvelope`], so callers can tell a policy rejection from a backend
//! failure by its `code`. Protocol failures use JSON-RPC error codes.
//!
//! # Usage
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "sqlgate": {
//!       "command": "sqlgate",
//!       "args": ["--config", "/path/to/sqlgate.toml"]
//!     }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::error::SqlGateError;
use crate::output::{ErrorEnvelope, Metadata, SuccessEnvelope};
use crate::resources::{self, RESOURCE_TEMPLATES};
use crate::sources::SourceManager;
use crate::tools::{self, ToolRegistryHandle};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    /// Absent for notifications
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn error(id: Option<Value>, error: JsonRpcError) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl From<SqlGateError> for JsonRpcError {
    fn from(err: SqlGateError) -> Self {
        let code = match err {
            SqlGateError::InvalidInput(_) | SqlGateError::ConnectorNotFound(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        Self { code, message: err.message(), data: Some(json!({ "code": err.error_code() })) }
    }
}

// ============================================================================
// MCP Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    text: String,
}

impl TextContent {
    fn new(text: String) -> Self {
        Self { content_type: "text", text }
    }
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    fn new(envelope: &impl Serialize, is_error: bool) -> Result<Value, JsonRpcError> {
        let text = serde_json::to_string_pretty(envelope)
            .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, format!("Failed to encode result: {e}")))?;
        serde_json::to_value(Self { content: vec![TextContent::new(text)], is_error })
            .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, format!("Failed to encode result: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ReadResourceParams {
    uri: String,
    #[serde(default)]
    source: Option<String>,
}

// ============================================================================
// MCP Server
// ============================================================================

pub struct McpServer {
    tools: ToolRegistryHandle,
    sources: Arc<SourceManager>,
}

impl McpServer {
    #[must_use]
    pub fn new(tools: ToolRegistryHandle, sources: Arc<SourceManager>) -> Self {
        Self { tools, sources }
    }

    /// Serve requests from stdin until it closes
    ///
    /// # Errors
    /// Only when stdio itself fails.
    pub async fn serve(&self) -> anyhow::Result<()> {
        info!(sources = self.sources.len(), "MCP server listening on stdio");
        self.serve_io(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
    }

    /// Serve line-delimited requests from `reader`, answering on `writer`
    ///
    /// # Errors
    /// Only when reading or writing fails.
    pub async fn serve_io<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                let mut encoded = serde_json::to_string(&response)?;
                encoded.push('\n');
                writer.write_all(encoded.as_bytes()).await?;
                writer.flush().await?;
            }
        }
        debug!("stdin closed, stopping MCP server");
        Ok(())
    }

    /// Handle one raw request line; `None` for notifications
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                warn!(error = %e, "Unparseable request");
                Some(JsonRpcResponse::error(None, JsonRpcError::new(PARSE_ERROR, format!("Parse error: {e}"))))
            }
        }
    }

    /// Route a request by method
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.method.starts_with("notifications/") || request.id.is_none() {
            debug!(method = %request.method, "Notification received");
            return None;
        }

        debug!(method = %request.method, "Handling request");
        let result = match request.method.as_str() {
            "initialize" => Ok(handle_initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(request.params).await,
            "resources/list" => Ok(handle_list_resources()),
            "resources/templates/list" => Ok(json!({ "resourceTemplates": RESOURCE_TEMPLATES })),
            "resources/read" => self.handle_read_resource(request.params).await,
            method => Err(JsonRpcError::new(METHOD_NOT_FOUND, format!("Unknown method: {method}"))),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::result(request.id, value),
            Err(e) => JsonRpcResponse::error(request.id, e),
        })
    }

    fn handle_list_tools(&self) -> Result<Value, JsonRpcError> {
        let registry = self.tools.get().map_err(|e| {
            error!(error = %e, "tools/list before registry initialization");
            JsonRpcError::from(e)
        })?;
        Ok(json!({ "tools": tools::tool_definitions(&registry) }))
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CallToolParams = parse_params(params)?;
        let registry = self.tools.get().map_err(JsonRpcError::from)?;

        let source = tools::target_source(&registry, &self.sources, &params.name, &params.arguments)
            .map(|s| s.config.id.clone())
            .unwrap_or_else(|_| {
                params.arguments.get("source").and_then(Value::as_str).unwrap_or_default().to_string()
            });

        let start = Instant::now();
        match tools::call_tool(&registry, &self.sources, &params.name, params.arguments).await {
            Ok(data) => {
                let execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let meta = match data.get("row_count").and_then(Value::as_u64) {
                    Some(rows) => Metadata::with_rows(execution_ms, usize::try_from(rows).unwrap_or(usize::MAX)),
                    None => Metadata::new(execution_ms),
                };
                info!(tool = %params.name, source = %source, ms = execution_ms, "Tool call succeeded");
                CallToolResult::new(&SuccessEnvelope::new(source, params.name, data, meta), false)
            }
            Err(e) => {
                warn!(tool = %params.name, source = %source, code = e.error_code(), "Tool call failed");
                CallToolResult::new(&ErrorEnvelope::from_error(source, params.name, &e), true)
            }
        }
    }

    async fn handle_read_resource(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ReadResourceParams = parse_params(params)?;
        let payload = resources::read(&params.uri, params.source.as_deref(), &self.sources)
            .await
            .map_err(JsonRpcError::from)?;
        let text = serde_json::to_string_pretty(&payload)
            .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, format!("Failed to encode resource: {e}")))?;

        Ok(json!({
            "contents": [{
                "uri": params.uri,
                "mimeType": "application/json",
                "text": text,
            }]
        }))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {},
            "resources": {}
        },
        "serverInfo": {
            "name": "sqlgate",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

fn handle_list_resources() -> Value {
    json!({
        "resources": [{
            "uri": "db://schemas",
            "name": "schemas",
            "description": "Schemas of the source",
            "mimeType": "application/json"
        }]
    })
}
