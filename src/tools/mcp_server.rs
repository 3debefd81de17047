//! Server-side MCP tool dispatch (C5): stdio and HTTP-JSON-RPC clients
//! spawned from a configured settings file, grounded on
//! `original_source`'s `core/providers/tools/server_mcp/mcp_client.py`
//! (`ServerMCPClient._worker`'s stdio-vs-url branch). Each configured
//! server contributes its `tools/list` result to the shared tool set
//! every connection registers at session init.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use crate::tools::{ToolBackend, ToolError, ToolResult, ToolSchema};

const MCP_CALL_TIMEOUT_SECS: u64 = 15;
const MCP_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// `.mcp_server_settings.json` shape: a map of server name to either a
/// stdio (`command`/`args`/`env`) or HTTP (`url`/`headers`) entry.
#[derive(Debug, Deserialize)]
struct McpSettingsFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, McpServerEntry>,
}

#[derive(Debug, Deserialize)]
struct McpServerEntry {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Reads the settings file, connects every configured server, and
/// returns the flattened set of tools they expose, each paired with the
/// backend that dispatches its calls. A server that fails to start is
/// logged and skipped rather than failing the whole gateway.
pub async fn spawn_configured_servers(settings_path: &str) -> Result<Vec<(ToolSchema, Arc<dyn ToolBackend>)>> {
    let raw = tokio::fs::read_to_string(settings_path)
        .await
        .with_context(|| format!("failed to read MCP settings file at {settings_path}"))?;
    let settings: McpSettingsFile = serde_json::from_str(&raw).context("invalid MCP settings file")?;

    let mut tools = Vec::new();
    for (name, entry) in settings.mcp_servers {
        let (schemas, backend): (Result<Vec<ToolSchema>>, Arc<dyn ToolBackend>) =
            if let Some(command) = entry.command.clone() {
                match StdioMcpClient::connect(command, entry.args.clone(), entry.env.clone()).await {
                    Ok(client) => {
                        let client = Arc::new(client);
                        let schemas = client.list_schemas().await;
                        (schemas, client)
                    }
                    Err(e) => {
                        tracing::warn!(server = %name, error = %e, "failed to start stdio MCP server");
                        continue;
                    }
                }
            } else if let Some(url) = entry.url.clone() {
                let client = Arc::new(HttpMcpClient::new(url, entry.headers.clone()));
                let schemas = client.list_schemas().await;
                (schemas, client)
            } else {
                tracing::warn!(server = %name, "MCP server entry has neither 'command' nor 'url', skipping");
                continue;
            };

        match schemas {
            Ok(schemas) => {
                for schema in schemas {
                    tools.push((schema, backend.clone()));
                }
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "failed to list tools from MCP server");
            }
        }
    }

    Ok(tools)
}

fn parse_tools(result: Value) -> Result<Vec<ToolSchema>> {
    let tools = result.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();
    Ok(tools
        .into_iter()
        .filter_map(|t| {
            let name = t.get("name")?.as_str()?.to_string();
            let description = t.get("description").and_then(Value::as_str).unwrap_or("").to_string();
            let parameters = t.get("inputSchema").cloned().unwrap_or(json!({"type": "object", "properties": {}}));
            Some(ToolSchema { name, description, parameters })
        })
        .collect())
}

/// One stdio MCP child process (`npx`-style server, or any binary
/// speaking line-delimited JSON-RPC 2.0 over stdin/stdout).
struct StdioMcpClient {
    stdin: Mutex<ChildStdin>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: std::sync::atomic::AtomicU64,
    _child: Mutex<Child>,
}

impl StdioMcpClient {
    async fn list_schemas(&self) -> Result<Vec<ToolSchema>> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tools(result)
    }

    async fn connect(command: String, args: Vec<String>, env: HashMap<String, String>) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(&command);
        cmd.args(&args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().with_context(|| format!("failed to spawn MCP server '{command}'"))?;
        let stdin = child.stdin.take().context("MCP child has no stdin")?;
        let stdout = child.stdout.take().context("MCP child has no stdout")?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> = Arc::new(Mutex::new(HashMap::new()));
        let pending_reader = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&line) {
                            if let Some(id) = value.get("id").and_then(Value::as_u64) {
                                if let Some(tx) = pending_reader.lock().await.remove(&id) {
                                    let payload = value.get("result").cloned().unwrap_or_else(|| {
                                        value.get("error").cloned().unwrap_or(Value::Null)
                                    });
                                    let _ = tx.send(payload);
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        });

        let client = Self {
            stdin: Mutex::new(stdin),
            pending,
            next_id: std::sync::atomic::AtomicU64::new(1),
            _child: Mutex::new(child),
        };

        client
            .request_with_timeout(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "xiaozhi-gateway", "version": env!("CARGO_PKG_VERSION") },
                }),
                MCP_HANDSHAKE_TIMEOUT_SECS,
            )
            .await?;
        client.notify("notifications/initialized", json!({})).await?;

        Ok(client)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let envelope = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        self.stdin.lock().await.write_all(&line).await.context("failed to write MCP notification")
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, MCP_CALL_TIMEOUT_SECS).await
    }

    async fn request_with_timeout(&self, method: &str, params: Value, timeout_secs: u64) -> Result<Value> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        if let Err(e) = self.stdin.lock().await.write_all(&line).await {
            self.pending.lock().await.remove(&id);
            bail!("failed to write MCP request: {e}");
        }

        match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => bail!("MCP server closed the connection before responding"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("MCP request '{method}' timed out")
            }
        }
    }
}

#[async_trait]
impl ToolBackend for StdioMcpClient {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
            .map_err(|e| ToolError::Backend(e.to_string()))?;
        Ok(ToolResult::req_llm(result.to_string()))
    }
}

/// A remote MCP server reached over plain HTTP JSON-RPC rather than
/// stdio. The upstream client supports a persistent SSE event stream;
/// here each JSON-RPC call is a standalone POST, which is sufficient
/// for request/response tool calls and avoids holding an SSE socket
/// open per configured server for the gateway's lifetime.
struct HttpMcpClient {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    next_id: std::sync::atomic::AtomicU64,
}

impl HttpMcpClient {
    fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self { url, headers, client: reqwest::Client::new(), next_id: std::sync::atomic::AtomicU64::new(1) }
    }

    async fn list_schemas(&self) -> Result<Vec<ToolSchema>> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tools(result)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let envelope = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let mut req = self.client.post(&self.url).json(&envelope);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }

        let resp = req.send().await.context("MCP HTTP request failed")?;
        let body: Value = resp.json().await.context("invalid MCP HTTP response")?;
        if let Some(error) = body.get("error") {
            bail!("MCP server returned an error: {error}");
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ToolBackend for HttpMcpClient {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
            .map_err(|e| ToolError::Backend(e.to_string()))?;
        Ok(ToolResult::req_llm(result.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_list_result_into_schemas() {
        let result = json!({
            "tools": [
                { "name": "search", "description": "web search", "inputSchema": {"type": "object"} },
                { "name": "no_schema" }
            ]
        });
        let schemas = parse_tools(result).unwrap();
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0].name, "search");
        assert_eq!(schemas[1].parameters, json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn settings_file_parses_stdio_and_http_entries() {
        let raw = r#"{
            "mcpServers": {
                "local-fs": {"command": "npx", "args": ["-y", "mcp-server-fs"]},
                "remote": {"url": "https://example.com/mcp", "headers": {"Authorization": "Bearer x"}}
            }
        }"#;
        let parsed: McpSettingsFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.mcp_servers.len(), 2);
        assert_eq!(parsed.mcp_servers["local-fs"].command.as_deref(), Some("npx"));
        assert_eq!(parsed.mcp_servers["remote"].url.as_deref(), Some("https://example.com/mcp"));
    }
}
