//! MCP (Model Context Protocol) Server
//!
//! This module implements an MCP server using manual JSON-RPC 2.0 over stdio.
//!
//! # Architecture
//!
//! - **Transport**: JSON-RPC 2.0 over stdio (line-based), tokio async I/O
//! - **Concurrency**: every `tools/call` runs on its own task; responses are written by a
//!   single writer task in completion order
//! - **Cancellation**: `notifications/cancelled` aborts the matching in-flight call
//!
//! Logs never go to stdout; it carries protocol messages only.
//!
//! # Usage
//!
//! Configure in an MCP host:
//! ```json
//! {
//!   "mcpServers": {
//!     "sqlgate": {
//!       "command": "sqlgate",
//!       "args": ["--config", "/path/to/config.json"]
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::dispatch::{Dispatcher, Tool, ToolCall};
use crate::output::ResultEnvelope;

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request (or notification, when `id` is absent)
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":-32603,"message":"serialization failed: {e}"}}}}"#
            )
        })
    }
}

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    text: String,
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl From<&ResultEnvelope> for CallToolResult {
    fn from(envelope: &ResultEnvelope) -> Self {
        Self {
            content: vec![TextContent { content_type: "text", text: envelope.to_json() }],
            is_error: !envelope.ok,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: Value,
}

// ============================================================================
// MCP Server
// ============================================================================

type InFlight = Arc<Mutex<HashMap<String, AbortHandle>>>;

/// Serve MCP on stdin/stdout until stdin closes
///
/// # Errors
///
/// Returns an error if reading stdin fails.
pub async fn serve<B: Backend>(dispatcher: Arc<Dispatcher<B>>) -> Result<()> {
    serve_io(dispatcher, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Serve MCP over arbitrary line-oriented I/O
///
/// Returns once the input is exhausted and every in-flight call has answered.
pub async fn serve_io<B, R, W>(dispatcher: Arc<Dispatcher<B>>, reader: R, writer: W) -> Result<()>
where
    B: Backend,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_lines(writer, rx));
    let in_flight: InFlight = Arc::default();
    let mut calls = JoinSet::new();

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        while calls.try_join_next().is_some() {}

        if line.trim().is_empty() {
            continue;
        }

        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(response) => {
                let _ = tx.send(response.to_line());
                continue;
            }
        };

        let Some(id) = request.id else {
            handle_notification(&request.method, request.params, &in_flight);
            continue;
        };

        match request.method.as_str() {
            "tools/call" => {
                let params = match request.params.map(serde_json::from_value::<CallToolParams>) {
                    Some(Ok(params)) => params,
                    Some(Err(e)) => {
                        let message = format!("Invalid params: {e}");
                        let reply = JsonRpcResponse::failure(id, INVALID_PARAMS, message);
                        let _ = tx.send(reply.to_line());
                        continue;
                    }
                    None => {
                        let reply = JsonRpcResponse::failure(id, INVALID_PARAMS, "Missing params");
                        let _ = tx.send(reply.to_line());
                        continue;
                    }
                };

                let key = id.to_string();
                let dispatcher = Arc::clone(&dispatcher);
                let tx = tx.clone();
                let registry = Arc::clone(&in_flight);
                let task_key = key.clone();
                // held across spawn so a fast call cannot deregister before it is registered
                let mut registered = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                let handle = calls.spawn(async move {
                    let envelope = match ToolCall::from_value(params.name, params.arguments) {
                        Ok(call) => dispatcher.dispatch(call).await,
                        Err(e) => ResultEnvelope::failure(&e),
                    };
                    registry.lock().unwrap_or_else(PoisonError::into_inner).remove(&task_key);
                    let result = serde_json::to_value(CallToolResult::from(&envelope))
                        .unwrap_or_default();
                    let _ = tx.send(JsonRpcResponse::success(id, result).to_line());
                });
                registered.insert(key, handle);
            }
            method => {
                let response = handle_request(method, id);
                let _ = tx.send(response.to_line());
            }
        }
    }

    debug!(pending = calls.len(), "input closed, waiting for in-flight calls");
    while calls.join_next().await.is_some() {}

    drop(tx);
    if let Err(e) = writer_task.await {
        warn!(error = %e, "response writer failed");
    }
    Ok(())
}

/// Parse one line into a request, or the error response to send instead
fn parse_request(line: &str) -> std::result::Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}"))
    })?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        JsonRpcResponse::failure(id, INVALID_REQUEST, format!("Invalid request: {e}"))
    })
}

/// Handle a request that is answered inline
fn handle_request(method: &str, id: Value) -> JsonRpcResponse {
    match method {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": "sqlgate",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": Tool::catalogue() })),
        "ping" => JsonRpcResponse::success(id, json!({})),
        other => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Unknown method: {other}")),
    }
}

fn handle_notification(method: &str, params: Option<Value>, in_flight: &InFlight) {
    match method {
        "notifications/cancelled" => {
            let cancelled = params.and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
            let Some(params) = cancelled else {
                return;
            };
            let key = params.request_id.to_string();
            if let Some(handle) =
                in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(&key)
            {
                debug!(request = %key, "cancelling tool call");
                handle.abort();
            }
        }
        "notifications/initialized" => {}
        other => debug!(method = other, "ignoring notification"),
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "could not write response");
            return;
        }
    }
}
