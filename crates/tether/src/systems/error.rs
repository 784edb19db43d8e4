use thiserror::Error;

use crate::errors::AgentError;

/// Failures talking to a tool provider
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("Failed to connect: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("Request `{method}` timed out after {seconds}s")]
    Timeout { method: String, seconds: u64 },

    #[error("Connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<SystemError> for AgentError {
    fn from(err: SystemError) -> Self {
        match err {
            SystemError::Server { code: -32602, message } => AgentError::InvalidParameters(message),
            other => AgentError::ExecutionError(other.to_string()),
        }
    }
}
