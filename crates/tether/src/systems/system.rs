use async_trait::async_trait;

use super::error::SystemError;
use super::protocol::ServerCapabilities;
use super::transport::TransportKind;
use crate::errors::AgentResult;
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};

/// One page of a tool listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPage {
    pub tools: Vec<Tool>,
    /// Absent or empty when there are no more pages
    pub next_cursor: Option<String>,
}

impl ToolPage {
    pub fn is_last(&self) -> bool {
        self.next_cursor.as_deref().map_or(true, str::is_empty)
    }
}

/// Core trait that defines a system that can be operated by an AI agent
#[async_trait]
pub trait System: Send + Sync {
    /// Get the name of the system
    fn name(&self) -> &str;

    fn transport(&self) -> TransportKind;

    /// Perform the protocol handshake and report what the system can do
    async fn initialize(&self) -> Result<ServerCapabilities, SystemError>;

    /// Fetch one page of the tool listing
    async fn list_tools(&self, cursor: Option<String>) -> Result<ToolPage, SystemError>;

    /// Call a tool with the given parameters
    ///
    /// Failures of any kind are reported as an `AgentError` so they can be shown
    /// to the model as an error result.
    async fn call(&self, tool_call: ToolCall) -> AgentResult<Vec<Content>>;

    async fn shutdown(&self) -> Result<(), SystemError>;
}
