//! Tool registry (C5): uniform dispatch over plugin, IoT, server-MCP and
//! device-MCP tools.

pub mod mcp_server;
pub mod registry;

pub use mcp_server::spawn_configured_servers;
pub use registry::{
    IotDescriptor, IotMethod, IotProperty, Tool, ToolAction, ToolBackend, ToolError, ToolKind,
    ToolRegistry, ToolResult, ToolSchema,
};
