use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::SystemError;
use super::http::HttpTransport;
use super::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, ServerCapabilities, PROTOCOL_VERSION,
};
use super::stdio::StdioTransport;
use super::system::{System, ToolPage};
use super::transport::{Transport, TransportKind};
use super::{NotificationSink, SystemConfig, TransportConfig};
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};

/// A system reached over MCP through any transport
pub struct RemoteSystem {
    name: String,
    transport: Arc<dyn Transport>,
}

impl RemoteSystem {
    pub fn new<S: Into<String>>(name: S, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }
}

/// Open the transport described by `config`. The handshake is left to `System::initialize`.
pub fn connect(
    config: &SystemConfig,
    sink: NotificationSink,
) -> Result<Arc<dyn System>, SystemError> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let transport: Arc<dyn Transport> = match &config.transport {
        TransportConfig::Stdio { command, args, env } => Arc::new(StdioTransport::spawn(
            &config.name,
            command,
            args,
            env,
            timeout,
            sink,
        )?),
        TransportConfig::Http { url } => {
            Arc::new(HttpTransport::new(&config.name, url, timeout, sink)?)
        }
    };
    Ok(Arc::new(RemoteSystem::new(config.name.clone(), transport)))
}

#[async_trait]
impl System for RemoteSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> TransportKind {
        self.transport.kind()
    }

    async fn initialize(&self) -> Result<ServerCapabilities, SystemError> {
        let result = self
            .transport
            .request("initialize", Some(json!(InitializeParams::client())))
            .await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| SystemError::Protocol(format!("Invalid initialize result: {}", e)))?;

        if result.protocol_version != PROTOCOL_VERSION {
            warn!(
                system = %self.name,
                requested = PROTOCOL_VERSION,
                negotiated = %result.protocol_version,
                "system negotiated a different protocol version"
            );
        }

        self.transport
            .notify("notifications/initialized", None)
            .await?;

        info!(
            system = %self.name,
            server = ?result.server_info.as_ref().map(|s| &s.name),
            tools = result.capabilities.supports_tools(),
            "system initialized"
        );
        Ok(result.capabilities)
    }

    async fn list_tools(&self, cursor: Option<String>) -> Result<ToolPage, SystemError> {
        let result = self
            .transport
            .request("tools/list", Some(json!(ListToolsParams { cursor })))
            .await?;
        let result: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| SystemError::Protocol(format!("Invalid tools/list result: {}", e)))?;

        Ok(ToolPage {
            tools: result.tools.into_iter().map(Tool::from).collect(),
            next_cursor: result.next_cursor,
        })
    }

    async fn call(&self, tool_call: ToolCall) -> AgentResult<Vec<Content>> {
        debug!(system = %self.name, tool = %tool_call.name, "calling tool");
        let params = CallToolParams {
            name: tool_call.name,
            arguments: tool_call.arguments,
        };
        let result = self
            .transport
            .request("tools/call", Some(json!(params)))
            .await?;
        let result: CallToolResult = serde_json::from_value(result).map_err(|e| {
            AgentError::ExecutionError(format!("Invalid tools/call result: {}", e))
        })?;

        let content: Vec<Content> = result.content.into_iter().map(Content::from).collect();
        if result.is_error.unwrap_or(false) {
            let text: Vec<&str> = content.iter().filter_map(Content::as_text).collect();
            return Err(AgentError::ExecutionError(text.join("\n")));
        }
        Ok(content)
    }

    async fn shutdown(&self) -> Result<(), SystemError> {
        debug!(system = %self.name, "shutting down system");
        self.transport.close().await
    }
}
