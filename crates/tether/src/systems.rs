//! Tool providers ("systems") reached over the Model Context Protocol
//!
//! A system is a remote process or endpoint that advertises tools. Each one is
//! connected once at startup through a [`transport::Transport`] and then shared
//! between concurrent tool calls as an `Arc<dyn System>`.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub mod error;
pub mod http;
pub mod protocol;
pub mod remote;
pub mod stdio;
pub mod system;
pub mod transport;

pub use error::SystemError;
pub use protocol::Notification;
pub use remote::{connect, RemoteSystem};
pub use system::{System, ToolPage};
pub use transport::{Transport, TransportKind};

/// Type alias for a cancellation function that can be called to terminate a running operation
pub type CancelFn = Arc<dyn Fn() + Send + Sync>;

fn default_request_timeout() -> u64 {
    30
}

/// How to reach one tool provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Upper bound for a single protocol request such as `initialize` or `tools/list`
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

impl SystemConfig {
    pub fn stdio<N: Into<String>, C: Into<String>>(name: N, command: C, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn http<N: Into<String>, U: Into<String>>(name: N, url: U) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Http { url: url.into() },
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Http { .. } => TransportKind::Http,
        }
    }
}

/// Where server-initiated notifications go
#[derive(Clone, Default)]
pub struct NotificationSink(Option<Arc<dyn Fn(Notification) + Send + Sync>>);

impl NotificationSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        Self(Some(Arc::new(f)))
    }

    pub fn discard() -> Self {
        Self(None)
    }

    pub fn send(&self, notification: Notification) {
        match &self.0 {
            Some(f) => f(notification),
            None => tracing::trace!(
                system = %notification.system,
                method = %notification.method,
                "dropping notification"
            ),
        }
    }
}

impl fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NotificationSink")
            .field(&self.0.is_some())
            .finish()
    }
}
