//! JSON-RPC 2.0 framing and the subset of MCP messages we speak
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::SystemError;
use crate::models::content::Content;
use crate::models::tool::Tool;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: json!(id),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    /// The result, or the server error it carries
    pub fn into_result(self) -> Result<Value, SystemError> {
        if let Some(error) = self.error {
            return Err(SystemError::Server {
                code: error.code,
                message: error.message,
            });
        }
        // A null or absent result is legal for methods without a payload
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Anything a server can send us
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(JsonRpcResponse),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl Incoming {
    pub fn classify(value: Value) -> Result<Self, SystemError> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
        let incoming = match (has_method, has_id) {
            (true, true) => Incoming::Request(serde_json::from_value(value)?),
            (true, false) => Incoming::Notification(serde_json::from_value(value)?),
            (false, true) => Incoming::Response(serde_json::from_value(value)?),
            (false, false) => {
                return Err(SystemError::Protocol(format!(
                    "message is neither a request nor a response: {}",
                    value
                )))
            }
        };
        Ok(incoming)
    }
}

/// A server-initiated notification, tagged with the system that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub system: String,
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new<S: Into<String>, M: Into<String>>(system: S, method: M, params: Option<Value>) -> Self {
        Self {
            system: system.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

impl InitializeParams {
    pub fn client() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: "tether".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Option<Implementation>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

impl ServerCapabilities {
    pub fn supports_tools(&self) -> bool {
        self.tools.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

impl From<McpTool> for Tool {
    fn from(tool: McpTool) -> Self {
        let input_schema = match tool.input_schema {
            Value::Null => json!({"type": "object", "properties": {}}),
            schema => schema,
        };
        Tool::new(tool.name, tool.description.unwrap_or_default(), input_schema)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        data: String,
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl From<ToolContent> for Content {
    fn from(content: ToolContent) -> Self {
        match content {
            ToolContent::Text { text } => Content::text(text),
            ToolContent::Image { data, mime_type } => Content::image(data, mime_type),
            ToolContent::Resource { resource } => match resource.text {
                Some(text) => Content::text(text),
                None => Content::text(format!("[resource: {}]", resource.uri)),
            },
            ToolContent::Unsupported => Content::text("[unsupported content]"),
        }
    }
}
