use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use strum_macros::Display;

use super::error::SystemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

/// Moves JSON-RPC messages between us and one server
///
/// Implementations correlate responses with requests themselves, so `request`
/// may be called concurrently from many tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, SystemError>;

    /// Send a notification, which has no response
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SystemError>;

    /// Tear down the connection; further requests fail with `SystemError::Closed`
    async fn close(&self) -> Result<(), SystemError>;

    fn kind(&self) -> TransportKind;
}

/// Tool calls run under the caller's deadline rather than the per-request limit
pub const TOOL_CALL: &str = "tools/call";

/// The transport-level limit for `method`, or `None` when the caller bounds it
pub fn request_limit(method: &str, limit: Duration) -> Option<Duration> {
    (method != TOOL_CALL).then_some(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Stdio.to_string(), "stdio");
        assert_eq!(TransportKind::Http.to_string(), "http");
    }

    #[test]
    fn test_tool_calls_have_no_transport_limit() {
        let limit = Duration::from_secs(30);
        assert_eq!(request_limit("initialize", limit), Some(limit));
        assert_eq!(request_limit("tools/list", limit), Some(limit));
        assert_eq!(request_limit(TOOL_CALL, limit), None);
    }
}
