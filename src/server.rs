use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::orchestrator::SharedState;

/// The MCP protocol revision this server speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// An incoming JSON-RPC 2.0 request. `id: None` marks a notification.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// An outgoing JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// The line-delimited JSON-RPC server over stdio. One request is processed
/// at a time; stdout carries only protocol frames.
pub struct StdioServer {
    dispatcher: Dispatcher,
    state: SharedState,
}

impl StdioServer {
    #[must_use]
    pub fn new(dispatcher: Dispatcher, state: SharedState) -> Self {
        Self { dispatcher, state }
    }

    /// Read requests from stdin until EOF, writing responses (and
    /// tool-list-changed notifications) to stdout.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` only on stdio failure; protocol-level
    /// problems are answered in-band.
    pub async fn run(&self) -> std::io::Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        let mut stdout = BufWriter::new(tokio::io::stdout());

        info!("stdio server ready");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let request: RpcRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("unparseable request line: {e}");
                    if let Some(id) = extract_id(&line) {
                        let response =
                            RpcResponse::error(id, -32700, format!("parse error: {e}"));
                        write_frame(&mut stdout, &serde_json::to_value(&response)?).await?;
                    }
                    continue;
                }
            };

            let Some(id) = request.id.clone() else {
                self.handle_notification(&request);
                continue;
            };

            let visibility_before = self.advanced_enabled().await;
            let response = self.handle_request(id, &request).await;
            write_frame(&mut stdout, &serde_json::to_value(&response)?).await?;

            // A visibility flip is announced to the caller right after the
            // response that caused it.
            if self.advanced_enabled().await != visibility_before {
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/tools/list_changed",
                });
                write_frame(&mut stdout, &notification).await?;
            }
        }
        info!("stdin closed, server loop ending");
        Ok(())
    }

    async fn advanced_enabled(&self) -> bool {
        self.state.lock().await.advanced_tools
    }

    fn handle_notification(&self, request: &RpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" => debug!("client initialized"),
            other => debug!("ignoring notification {other}"),
        }
    }

    async fn handle_request(&self, id: Value, request: &RpcRequest) -> RpcResponse {
        match request.method.as_str() {
            "initialize" => RpcResponse::result(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": { "listChanged": true },
                    },
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "tools/list" => {
                let advanced = self.advanced_enabled().await;
                RpcResponse::result(id, json!({ "tools": self.dispatcher.list_tools(advanced) }))
            }
            "tools/call" => {
                let name = request.params["name"].as_str().unwrap_or_default();
                if name.is_empty() {
                    return RpcResponse::error(id, -32602, "missing tool name");
                }
                let arguments = request.params.get("arguments").cloned().unwrap_or(json!({}));
                let outcome = self.dispatcher.call(&self.state, name, &arguments).await;
                let is_error = outcome["success"] == json!(false);
                let text = serde_json::to_string(&outcome).unwrap_or_else(|_| "{}".into());
                RpcResponse::result(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                        "isError": is_error,
                    }),
                )
            }
            "ping" => RpcResponse::result(id, json!({})),
            other => RpcResponse::error(id, -32601, format!("method not found: {other}")),
        }
    }
}

/// Best-effort id extraction from an unparseable request line, so the
/// caller still gets a correlated parse error.
fn extract_id(line: &str) -> Option<Value> {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").cloned())
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    out: &mut W,
    frame: &Value,
) -> std::io::Result<()> {
    let text = serde_json::to_string(frame)?;
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
