use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single tool invocation. These are folded into the transcript as
/// error tool results, so they are cloneable and serializable like the rest of a message.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Tool `{tool}` timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("Tool call cancelled: {0}")]
    Cancelled(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
