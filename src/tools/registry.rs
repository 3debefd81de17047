//! Uniform tool dispatch (C5) across four tool kinds: plugin functions
//! registered at load, IoT device tools uploaded per-connection,
//! server-side MCP tools, and device-side MCP tools proxied over the
//! WebSocket. Owned exclusively by one connection's orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool backend error: {0}")]
    Backend(String),
    #[error("tool call timed out")]
    Timeout,
}

/// Outcome of a tool invocation, mirroring `original_source`'s
/// `ActionResponse` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub action: ToolAction,
    /// Set on REQLLM: fed back to the LLM as a tool message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Set on RESPONSE: spoken to the user directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolAction {
    Response,
    ReqLlm,
    NotFound,
    Error,
    None,
}

impl ToolResult {
    pub fn req_llm(result: impl Into<String>) -> Self {
        Self { action: ToolAction::ReqLlm, result: Some(result.into()), response: None }
    }

    pub fn response(text: impl Into<String>) -> Self {
        Self { action: ToolAction::Response, result: None, response: Some(text.into()) }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { action: ToolAction::Error, result: None, response: Some(text.into()) }
    }

    pub fn not_found() -> Self {
        Self { action: ToolAction::NotFound, result: None, response: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Source kind a tool was registered from. Ordered: a name collision is
/// resolved in favor of the kind listed first here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    Plugin = 0,
    Iot = 1,
    ServerMcp = 2,
    DeviceMcp = 3,
}

/// Uniform call contract every tool kind dispatches through. Plugin tools
/// implement this directly; IoT/MCP tools are backed by a shared
/// [`ToolBackend`] that proxies the call over a channel or process.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn call(&self, arguments: Value) -> ToolResult;
}

/// Shared transport for a whole class of dynamically-registered tools
/// (one IoT descriptor, one MCP server). `name` passed to `invoke` is the
/// tool's *original* (unsanitized) name as the backend understands it.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError>;
}

struct BackendTool {
    original_name: String,
    schema: ToolSchema,
    backend: Arc<dyn ToolBackend>,
}

#[async_trait]
impl Tool for BackendTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn call(&self, arguments: Value) -> ToolResult {
        match self.backend.invoke(&self.original_name, arguments).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(format!("tool call failed: {e}")),
        }
    }
}

struct Entry {
    kind: ToolKind,
    tool: Arc<dyn Tool>,
}

/// Device-uploaded IoT capability description (§3 Glossary IoTDescriptor).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IotDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub properties: Vec<IotProperty>,
    #[serde(default)]
    pub methods: Vec<IotMethod>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IotProperty {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IotMethod {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Per-connection tool registry.
pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
    /// sanitized name -> original name, kept per kind for debugging/audit.
    name_map: HashMap<String, String>,
    finish_init: Arc<Notify>,
    initialized: std::sync::atomic::AtomicBool,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
            name_map: HashMap::new(),
            finish_init: Arc::new(Notify::new()),
            initialized: std::sync::atomic::AtomicBool::new(false),
        };
        registry.register_plugin(Arc::new(GetTimeTool));
        registry
    }

    fn insert(&mut self, sanitized: String, original: String, kind: ToolKind, tool: Arc<dyn Tool>) {
        if let Some(existing) = self.tools.get(&sanitized) {
            if existing.kind <= kind {
                tracing::debug!(
                    name = %sanitized, existing_kind = ?existing.kind, new_kind = ?kind,
                    "tool name collision, keeping higher-priority registration"
                );
                return;
            }
        }
        self.name_map.insert(sanitized.clone(), original);
        self.tools.insert(sanitized, Entry { kind, tool });
    }

    pub fn register_plugin(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        let sanitized = crate::types::sanitize_tool_name(&schema.name);
        self.insert(sanitized, schema.name, ToolKind::Plugin, tool);
    }

    /// Register a device-uploaded IoT descriptor as `iot_<name>_<method>`
    /// and `iot_<name>_get_<prop>`/`iot_<name>_set_<prop>` tools, all
    /// backed by the same dispatcher (the orchestrator's IoT proxy).
    pub fn register_iot_descriptor(&mut self, descriptor: IotDescriptor, backend: Arc<dyn ToolBackend>) {
        for method in &descriptor.methods {
            let original = format!("{}.{}", descriptor.name, method.name);
            let public_name = format!("iot_{}_{}", descriptor.name, method.name);
            let sanitized = crate::types::sanitize_tool_name(&public_name);
            let schema = ToolSchema {
                name: sanitized.clone(),
                description: format!("{}: {}", descriptor.description, method.description),
                parameters: method.parameters.clone(),
            };
            let tool = Arc::new(BackendTool { original_name: original, schema, backend: backend.clone() });
            self.insert(sanitized, public_name, ToolKind::Iot, tool);
        }
        for prop in &descriptor.properties {
            for (verb, original_suffix) in [("get", "get"), ("set", "set")] {
                let original = format!("{}.{}_{}", descriptor.name, original_suffix, prop.name);
                let public_name = format!("iot_{}_{}_{}", descriptor.name, verb, prop.name);
                let sanitized = crate::types::sanitize_tool_name(&public_name);
                let schema = ToolSchema {
                    name: sanitized.clone(),
                    description: format!("{} {}: {}", verb, prop.name, prop.description),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                };
                let tool = Arc::new(BackendTool { original_name: original, schema, backend: backend.clone() });
                self.insert(sanitized, public_name, ToolKind::Iot, tool);
            }
        }
    }

    pub fn register_server_mcp_tool(&mut self, schema: ToolSchema, backend: Arc<dyn ToolBackend>) {
        let original = schema.name.clone();
        let sanitized = crate::types::sanitize_tool_name(&schema.name);
        let tool = Arc::new(BackendTool {
            original_name: original.clone(),
            schema: ToolSchema { name: sanitized.clone(), ..schema },
            backend,
        });
        self.insert(sanitized, original, ToolKind::ServerMcp, tool);
    }

    pub fn register_device_mcp_tool(&mut self, schema: ToolSchema, backend: Arc<dyn ToolBackend>) {
        let original = schema.name.clone();
        let sanitized = crate::types::sanitize_tool_name(&schema.name);
        let tool = Arc::new(BackendTool {
            original_name: original.clone(),
            schema: ToolSchema { name: sanitized.clone(), ..schema },
            backend,
        });
        self.insert(sanitized, original, ToolKind::DeviceMcp, tool);
    }

    pub fn get_functions(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|e| e.tool.schema()).collect()
    }

    pub async fn handle_llm_function_call(&self, name: &str, arguments: Value) -> ToolResult {
        match self.tools.get(name) {
            Some(entry) => entry.tool.call(arguments).await,
            None => ToolResult::not_found(),
        }
    }

    pub fn original_name(&self, sanitized: &str) -> Option<&str> {
        self.name_map.get(sanitized).map(|s| s.as_str())
    }

    /// Signal that async initialization (server-MCP spawn, etc.) is done.
    pub fn signal_init_complete(&self) {
        self.initialized.store(true, std::sync::atomic::Ordering::SeqCst);
        self.finish_init.notify_waiters();
    }

    /// IoT descriptor handlers block up to 5s waiting for init per §4.5.
    pub async fn wait_ready(&self) {
        if self.initialized.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.finish_init.notified()).await;
    }
}

/// Illustrative plugin tool grounded on `original_source`'s
/// `plugins_func/functions/get_time.py` (calendar/date query).
struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_time".to_string(),
            description: "Get the current date, weekday, and time. Only call this for queries \
                that require precise calendar arithmetic; for 'what's today' questions answer \
                from context instead."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to report: date, weekday, time, or day-of-year"
                    }
                },
                "required": []
            }),
        }
    }

    async fn call(&self, _arguments: Value) -> ToolResult {
        let now = Local::now();
        let text = format!(
            "Date: {}\nWeekday: {}\nTime: {}\nDay of year: {}",
            now.format("%Y-%m-%d"),
            now.format("%A"),
            now.format("%H:%M:%S"),
            now.ordinal()
        );
        ToolResult::req_llm(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_time_plugin_is_registered_by_default() {
        let registry = ToolRegistry::new();
        let schemas = registry.get_functions();
        assert!(schemas.iter().any(|s| s.name == "get_time"));

        let result = registry.handle_llm_function_call("get_time", serde_json::json!({})).await;
        assert_eq!(result.action, ToolAction::ReqLlm);
        assert!(result.result.unwrap().contains("Date:"));
    }

    #[tokio::test]
    async fn unknown_tool_returns_not_found() {
        let registry = ToolRegistry::new();
        let result = registry.handle_llm_function_call("nonexistent", serde_json::json!({})).await;
        assert_eq!(result.action, ToolAction::NotFound);
    }

    struct EchoBackend;

    #[async_trait]
    impl ToolBackend for EchoBackend {
        async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::response(format!("{name}:{arguments}")))
        }
    }

    #[tokio::test]
    async fn iot_descriptor_registers_method_and_property_tools() {
        let mut registry = ToolRegistry::new();
        let descriptor = IotDescriptor {
            name: "lamp".to_string(),
            description: "desk lamp".to_string(),
            properties: vec![IotProperty { name: "brightness".to_string(), description: "level".to_string() }],
            methods: vec![IotMethod {
                name: "set_on".to_string(),
                description: "turn on".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }],
        };
        registry.register_iot_descriptor(descriptor, Arc::new(EchoBackend));

        let names: Vec<String> = registry.get_functions().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"iot_lamp_set_on".to_string()));
        assert!(names.contains(&"iot_lamp_get_brightness".to_string()));
        assert!(names.contains(&"iot_lamp_set_brightness".to_string()));

        let result = registry
            .handle_llm_function_call("iot_lamp_set_on", serde_json::json!({}))
            .await;
        assert_eq!(result.action, ToolAction::Response);
    }

    #[tokio::test]
    async fn plugin_wins_name_collision_over_later_registrations() {
        let mut registry = ToolRegistry::new();
        let descriptor = IotDescriptor {
            name: "shadow".to_string(),
            description: "conflicting".to_string(),
            properties: vec![],
            methods: vec![IotMethod {
                name: "x".to_string(),
                description: "".to_string(),
                parameters: serde_json::json!({}),
            }],
        };
        // Force a collision by registering an IoT tool under the plugin's
        // exact sanitized name.
        registry.register_iot_descriptor(descriptor, Arc::new(EchoBackend));
        let before = registry.get_functions().len();
        // Re-register get_time again as if it came from a lower-priority
        // source; it must not be able to override the plugin entry.
        registry.register_server_mcp_tool(
            ToolSchema {
                name: "get_time".to_string(),
                description: "shadow".to_string(),
                parameters: serde_json::json!({}),
            },
            Arc::new(EchoBackend),
        );
        assert_eq!(registry.get_functions().len(), before);
        let result = registry.handle_llm_function_call("get_time", serde_json::json!({})).await;
        assert_eq!(result.action, ToolAction::ReqLlm, "plugin get_time must win the collision");
    }
}
