//! MCP protocol message types and crate-level data model.
//!
//! MCP rides on JSON-RPC 2.0 with three message shapes: requests (carry an
//! id and expect a response), responses (result or error, correlated by
//! id), and notifications (fire-and-forget). Transports serialize and
//! deserialize [`McpMessage`] values; everything above the transport layer
//! works with these types directly.
//!
//! Two types here are not wire types: [`RemoteTool`] is a discovered tool
//! tagged with its owning server, and [`ToolOutcome`] is the uniform
//! success/error envelope handed to the agent's tool loop in place of
//! raised errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 version identifier.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Unique identifier for JSON-RPC requests.
pub type RequestId = Value;

/// Core MCP message variants following JSON-RPC 2.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpMessage {
    /// A request initiating an operation.
    Request(McpRequest),
    /// A response containing a result or an error.
    Response(McpResponse),
    /// A notification (no response expected).
    Notification(McpNotification),
}

/// Request message for initiating MCP operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Response message correlated to a request by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl McpResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Success { result },
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Error { error },
        }
    }
}

/// Exactly one of result or error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Success { result: Value },
    Error { error: RpcError },
}

/// Notification message for events that expect no response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("Method not found: {}", method.into()),
        )
    }
}

/// Server feature support advertised during the handshake.
///
/// Only the tools capability matters to this crate; unknown capability
/// keys from richer servers are ignored on deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// Tool-related server capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none", rename = "listChanged")]
    pub list_changed: Option<bool>,
}

/// Content items returned by tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none", rename = "mimeType")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl Content {
    /// Render this item as a single text line for the result envelope.
    pub fn render(&self) -> String {
        match self {
            Content::Text { text } => text.clone(),
            Content::Image { mime_type, .. } => format!("[image: {}]", mime_type),
            Content::Resource { uri, text, .. } => match text {
                Some(body) => body.clone(),
                None => format!("[resource: {}]", uri),
            },
        }
    }
}

/// Tool definition as listed by a server (`tools/list`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none", rename = "outputSchema")]
    pub output_schema: Option<Value>,
}

/// Result of a `tools/call` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "isError")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "structuredContent")]
    pub structured_content: Option<Value>,
}

/// Standard MCP method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const LIST_TOOLS: &str = "tools/list";
    pub const CALL_TOOL: &str = "tools/call";
}

/// A discovered tool tagged with the server that owns it.
///
/// Produced by a discovery pass; re-discovery replaces the whole set for
/// a server. Tool names are unique within one server, so the pair
/// (server, name) identifies a tool globally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub server: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

impl RemoteTool {
    pub fn from_spec(spec: ToolSpec, server: impl Into<String>) -> Self {
        Self {
            name: spec.name,
            description: spec.description,
            server: server.into(),
            input_schema: spec.input_schema,
            output_schema: spec.output_schema,
        }
    }
}

/// Uniform result envelope handed to the agent's tool loop.
///
/// This is the sole contract between the MCP subsystem and its consumer:
/// remote tool errors, disconnected servers, malformed responses, and
/// timeouts all arrive as `success: false` plus a message - never as a
/// propagated error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        rename = "structuredData",
        default
    )]
    pub structured_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(content: Vec<String>, structured_data: Option<Value>) -> Self {
        Self {
            success: true,
            content,
            structured_data,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            content: Vec::new(),
            structured_data: None,
            error: Some(message.into()),
        }
    }

    /// Fold a remote call result into the envelope.
    ///
    /// A result flagged `isError` becomes a failure whose message is the
    /// rendered content (servers put the explanation there).
    pub fn from_call_result(result: CallToolResult) -> Self {
        let rendered: Vec<String> = result.content.iter().map(Content::render).collect();
        if result.is_error.unwrap_or(false) {
            let message = if rendered.is_empty() {
                "remote tool reported an error".to_string()
            } else {
                rendered.join("\n")
            };
            Self::failure(message)
        } else {
            Self::ok(rendered, result.structured_content)
        }
    }
}
