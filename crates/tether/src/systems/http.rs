use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::SystemError;
use super::protocol::{Incoming, JsonRpcNotification, JsonRpcRequest, Notification};
use super::transport::{request_limit, Transport, TransportKind};
use super::NotificationSink;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// A server reached over streamable HTTP
///
/// Every message is a POST to one endpoint. The server answers with plain JSON or
/// with an event stream whose `data:` payloads carry the response and any
/// notifications sent before it.
pub struct HttpTransport {
    name: String,
    endpoint: String,
    client: Client,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
    closed: AtomicBool,
    timeout: Duration,
    sink: NotificationSink,
}

impl HttpTransport {
    pub fn new(
        name: &str,
        endpoint: &str,
        timeout: Duration,
        sink: NotificationSink,
    ) -> Result<Self, SystemError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SystemError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            client,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
            closed: AtomicBool::new(false),
            timeout,
            sink,
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    /// POST one message and return every JSON-RPC message found in the reply
    async fn post(&self, method: &str, body: &Value) -> Result<Vec<Value>, SystemError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SystemError::Closed);
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }
        if let Some(limit) = request_limit(method, self.timeout) {
            request = request.timeout(limit);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(method, e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut current) = self.session_id.lock() {
                if current.as_deref() != Some(session) {
                    debug!(system = %self.name, session = %session, "captured session id");
                    *current = Some(session.to_string());
                }
            }
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SystemError::Transport(format!(
                "HTTP error: {} - {}",
                status, body
            )));
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        let text = response.text().await.map_err(|e| self.map_send_error(method, e))?;

        if is_stream {
            parse_sse_events(&text)
                .iter()
                .map(|data| serde_json::from_str::<Value>(data).map_err(SystemError::from))
                .collect()
        } else if text.trim().is_empty() {
            Ok(Vec::new())
        } else {
            Ok(flatten_batch(serde_json::from_str(&text)?))
        }
    }

    fn map_send_error(&self, method: &str, err: reqwest::Error) -> SystemError {
        if err.is_timeout() {
            SystemError::Timeout {
                method: method.to_string(),
                seconds: self.timeout.as_secs(),
            }
        } else if err.is_connect() {
            SystemError::Connection(err.to_string())
        } else {
            SystemError::Http(err)
        }
    }

    fn dispatch(&self, messages: Vec<Value>, id: u64) -> Result<Value, SystemError> {
        let mut result = None;
        for message in messages {
            match Incoming::classify(message)? {
                Incoming::Response(response) if response.id.as_u64() == Some(id) => {
                    result = Some(response.into_result());
                }
                Incoming::Response(response) => {
                    debug!(system = %self.name, id = %response.id, "response for unknown request");
                }
                Incoming::Notification(notification) => self.sink.send(Notification::new(
                    self.name.clone(),
                    notification.method,
                    notification.params,
                )),
                Incoming::Request(request) => {
                    // Server requests need a standalone stream, which we never open
                    debug!(system = %self.name, method = %request.method, "ignoring server request");
                }
            }
        }
        result.unwrap_or_else(|| {
            Err(SystemError::Protocol(format!(
                "no response with id {} in reply",
                id
            )))
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, SystemError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;
        debug!(system = %self.name, id, method, "sending request");
        let messages = self.post(method, &body).await?;
        self.dispatch(messages, id)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SystemError> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.post(method, &body).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SystemError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = match self.session_id() {
            Some(session) => session,
            None => return Ok(()),
        };

        let response = self
            .client
            .delete(&self.endpoint)
            .header(SESSION_HEADER, session)
            .timeout(self.timeout)
            .send()
            .await?;
        // Servers that do not support explicit termination answer 405
        if !response.status().is_success() && response.status() != StatusCode::METHOD_NOT_ALLOWED {
            warn!(system = %self.name, status = %response.status(), "session termination failed");
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

/// The `data` payload of every event in an event stream body
pub fn parse_sse_events(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut data: Vec<&str> = Vec::new();

    for line in body.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if !data.is_empty() {
                events.push(data.join("\n"));
                data.clear();
            }
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // `event:`, `id:`, `retry:` and comments carry nothing we need
    }
    if !data.is_empty() {
        events.push(data.join("\n"));
    }
    events
}

fn flatten_batch(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        single => vec![single],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sse_events() {
        let body = "event: message\r\ndata: {\"a\":1}\r\n\r\n: keepalive\n\ndata: {\"b\":\ndata: 2}\n\n";
        assert_eq!(
            parse_sse_events(body),
            vec!["{\"a\":1}".to_string(), "{\"b\":\n2}".to_string()]
        );
    }

    #[test]
    fn test_parse_sse_without_trailing_blank_line() {
        assert_eq!(parse_sse_events("data:{}"), vec!["{}".to_string()]);
        assert!(parse_sse_events("").is_empty());
    }

    #[test]
    fn test_flatten_batch() {
        assert_eq!(flatten_batch(json!({"id": 1})).len(), 1);
        assert_eq!(flatten_batch(json!([{"id": 1}, {"id": 2}])).len(), 2);
    }
}
