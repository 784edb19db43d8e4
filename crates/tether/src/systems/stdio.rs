use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::SystemError;
use super::protocol::{
    Incoming, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Notification,
    METHOD_NOT_FOUND,
};
use super::transport::{request_limit, Transport, TransportKind};
use super::NotificationSink;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, SystemError>>>>>;

/// How long `close` waits for the child to exit on its own before killing it
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// A server running as a child process, speaking newline-delimited JSON-RPC on stdin/stdout
pub struct StdioTransport {
    name: String,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    child: tokio::sync::Mutex<Option<Child>>,
    timeout: Duration,
}

impl StdioTransport {
    /// Spawn the server process and start the reader and writer tasks
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
        sink: NotificationSink,
    ) -> Result<Self, SystemError> {
        info!(system = %name, command = %command, "spawning stdio system");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SystemError::Connection(format!("Failed to spawn process '{}': {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SystemError::Connection("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SystemError::Connection("Failed to capture stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(name.to_string(), stderr);
        }

        let alive = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        spawn_writer(name.to_string(), stdin, write_rx, alive.clone());
        spawn_reader(
            name.to_string(),
            stdout,
            pending.clone(),
            write_tx.downgrade(),
            alive.clone(),
            sink,
        );

        Ok(Self {
            name: name.to_string(),
            writer: Mutex::new(Some(write_tx)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            child: tokio::sync::Mutex::new(Some(child)),
            timeout,
        })
    }

    fn writer(&self) -> Result<mpsc::UnboundedSender<String>, SystemError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SystemError::Closed);
        }
        self.writer
            .lock()
            .map_err(|_| SystemError::Transport("writer lock poisoned".to_string()))?
            .clone()
            .ok_or(SystemError::Closed)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, SystemError> {
        let writer = self.writer()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .map_err(|_| SystemError::Transport("pending lock poisoned".to_string()))?
            .insert(id, tx);
        let mut guard = PendingGuard {
            id,
            pending: self.pending.clone(),
            writer: writer.clone(),
            armed: true,
        };

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        writer.send(line).map_err(|_| SystemError::Closed)?;
        debug!(system = %self.name, id, method, "sent request");

        let received = match request_limit(method, self.timeout) {
            Some(limit) => tokio::time::timeout(limit, rx).await.ok(),
            // Dropping this future still cancels the call through the guard
            None => Some(rx.await),
        };
        let result = match received {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(SystemError::Closed),
            None => {
                warn!(system = %self.name, method, "request timed out");
                Err(SystemError::Timeout {
                    method: method.to_string(),
                    seconds: self.timeout.as_secs(),
                })
            }
        };
        if !matches!(result, Err(SystemError::Timeout { .. })) {
            guard.armed = false;
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SystemError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.writer()?.send(line).map_err(|_| SystemError::Closed)
    }

    async fn close(&self) -> Result<(), SystemError> {
        self.alive.store(false, Ordering::SeqCst);
        // Dropping the last sender ends the writer task, which closes the child's stdin
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        fail_pending(&self.pending);

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(status) => debug!(system = %self.name, status = ?status, "system exited"),
                Err(_) => {
                    warn!(system = %self.name, "system did not exit, killing it");
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

/// Removes an abandoned request from the pending map and tells the server to stop working on it
struct PendingGuard {
    id: u64,
    pending: PendingMap,
    writer: mpsc::UnboundedSender<String>,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
        let cancel = JsonRpcNotification::new(
            "notifications/cancelled",
            Some(json!({"requestId": self.id, "reason": "request abandoned by client"})),
        );
        if let Ok(line) = serde_json::to_string(&cancel) {
            let _ = self.writer.send(line);
        }
    }
}

fn fail_pending(pending: &PendingMap) {
    if let Ok(mut pending) = pending.lock() {
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(SystemError::Closed));
        }
    }
}

fn spawn_writer(
    name: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    alive: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!(system = %name, error = %e, "failed to write to system");
                alive.store(false, Ordering::SeqCst);
                break;
            }
            if let Err(e) = stdin.flush().await {
                warn!(system = %name, error = %e, "failed to flush system stdin");
                alive.store(false, Ordering::SeqCst);
                break;
            }
        }
        debug!(system = %name, "writer exited");
    });
}

fn spawn_reader<R>(
    name: String,
    stdout: R,
    pending: PendingMap,
    writer: mpsc::WeakUnboundedSender<String>,
    alive: Arc<AtomicBool>,
    sink: NotificationSink,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(system = %name, error = %e, "failed to read from system");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let incoming = serde_json::from_str::<Value>(&line)
                .map_err(SystemError::from)
                .and_then(Incoming::classify);

            match incoming {
                Ok(Incoming::Response(response)) => {
                    let id = response.id.as_u64();
                    let tx = id.and_then(|id| pending.lock().ok().and_then(|mut p| p.remove(&id)));
                    match tx {
                        Some(tx) => {
                            let _ = tx.send(response.into_result());
                        }
                        None => debug!(system = %name, id = %response.id, "response for unknown request"),
                    }
                }
                Ok(Incoming::Notification(notification)) => {
                    sink.send(Notification::new(
                        name.clone(),
                        notification.method,
                        notification.params,
                    ));
                }
                Ok(Incoming::Request(request)) => {
                    let reply = match request.method.as_str() {
                        "ping" => JsonRpcResponse::success(request.id, json!({})),
                        other => {
                            debug!(system = %name, method = %other, "rejecting server request");
                            JsonRpcResponse::failure(request.id, METHOD_NOT_FOUND, "Method not found")
                        }
                    };
                    if let (Ok(line), Some(writer)) = (serde_json::to_string(&reply), writer.upgrade()) {
                        let _ = writer.send(line);
                    }
                }
                Err(e) => {
                    warn!(system = %name, error = %e, line = %line, "failed to parse message from system");
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        fail_pending(&pending);
        info!(system = %name, "system closed its output");
    });
}

fn spawn_stderr_drain<R>(name: String, stderr: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(system = %name, stderr = %line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_shell(script: &str, timeout: Duration) -> StdioTransport {
        StdioTransport::spawn(
            "sh",
            "sh",
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
            timeout,
            NotificationSink::discard(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let result = StdioTransport::spawn(
            "missing",
            "definitely-not-a-real-binary-name",
            &[],
            &HashMap::new(),
            Duration::from_secs(1),
            NotificationSink::discard(),
        );
        assert!(matches!(result, Err(SystemError::Connection(_))));
    }

    #[tokio::test]
    async fn test_eof_fails_pending_requests() {
        // Reads one request and exits without answering
        let transport = spawn_shell("read line", Duration::from_secs(5));
        let result = transport.request("tools/list", None).await;
        assert!(matches!(result, Err(SystemError::Closed)));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let transport = spawn_shell("sleep 5", Duration::from_millis(100));
        let result = transport.request("tools/list", None).await;
        assert!(matches!(result, Err(SystemError::Timeout { .. })));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_requests() {
        let transport = spawn_shell("cat > /dev/null", Duration::from_secs(1));
        transport.close().await.unwrap();
        assert!(matches!(
            transport.request("ping", None).await,
            Err(SystemError::Closed)
        ));
        assert!(matches!(
            transport.notify("notifications/initialized", None).await,
            Err(SystemError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_echo_response() {
        // Answers the first request with an empty result
        let script = r#"read line; echo '{"jsonrpc":"2.0","method":"notifications/message"}'; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; sleep 1"#;
        let transport = spawn_shell(script, Duration::from_secs(5));
        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_call_outlives_request_limit() {
        // Answers well after the 100ms limit that applies to other requests
        let script = r#"read line; sleep 1; echo '{"jsonrpc":"2.0","id":1,"result":{"content":[]}}'; sleep 1"#;
        let transport = spawn_shell(script, Duration::from_millis(100));
        let result = transport.request("tools/call", None).await.unwrap();
        assert_eq!(result, json!({"content": []}));
        transport.close().await.unwrap();
    }
}
