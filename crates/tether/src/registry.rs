//! Aggregates the tools of every configured system into one name-keyed registry
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::tool::Tool;
use crate::providers::utils::sanitize_function_name;
use crate::systems::{connect, NotificationSink, System, SystemConfig, SystemError};

/// Upper bound on `tools/list` round trips for one system
pub const MAX_LIST_PAGES: usize = 1000;

/// Something that went wrong, or was adjusted, while building the registry.
/// None of these stop the build.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryWarning {
    #[error("System `{system}` is unavailable: {message}")]
    Connection { system: String, message: String },

    #[error("System `{system}` failed to list its tools: {message}")]
    Listing { system: String, message: String },

    #[error("Tool `{tool}` from `{previous}` is replaced by the one from `{system}`")]
    Collision {
        tool: String,
        previous: String,
        system: String,
    },

    #[error("Tool `{original}` from `{system}` is exposed as `{renamed}`")]
    Renamed {
        system: String,
        original: String,
        renamed: String,
    },
}

impl RegistryWarning {
    pub fn system(&self) -> &str {
        match self {
            RegistryWarning::Connection { system, .. }
            | RegistryWarning::Listing { system, .. }
            | RegistryWarning::Collision { system, .. }
            | RegistryWarning::Renamed { system, .. } => system,
        }
    }
}

/// Where a registered tool name leads
#[derive(Clone)]
pub struct Route {
    pub system: Arc<dyn System>,
    /// The name the system itself knows the tool by
    pub tool_name: String,
}

/// Registered tools and the systems that serve them
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    routes: HashMap<String, Route>,
    systems: Vec<Arc<dyn System>>,
}

impl ToolRegistry {
    /// Connect to every configured system and register its tools
    ///
    /// Systems are contacted concurrently but registered in configuration order, so
    /// collisions resolve the same way on every run.
    pub async fn build(
        configs: &[SystemConfig],
        sink: NotificationSink,
    ) -> (ToolRegistry, Vec<RegistryWarning>) {
        let mut builder = RegistryBuilder::new();

        let mut connected = Vec::new();
        for config in configs {
            match connect(config, sink.clone()) {
                Ok(system) => connected.push(system),
                Err(e) => builder.record_failure(&config.name, e),
            }
        }

        let discovered = join_all(connected.iter().map(|system| discover(system.as_ref()))).await;
        for (system, result) in connected.into_iter().zip(discovered) {
            builder.commit(system, result).await;
        }

        builder.finish()
    }

    /// Schemas to advertise to the model, in registration order
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    pub fn system_for(&self, name: &str) -> Option<Arc<dyn System>> {
        self.routes.get(name).map(|route| route.system.clone())
    }

    pub fn systems(&self) -> &[Arc<dyn System>] {
        &self.systems
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Close every connection
    pub async fn shutdown(&mut self) {
        let systems = std::mem::take(&mut self.systems);
        self.routes.clear();
        self.tools.clear();
        for system in systems {
            if let Err(e) = system.shutdown().await {
                warn!(system = %system.name(), error = %e, "failed to shut down system");
            }
        }
    }

    fn insert(&mut self, system: &Arc<dyn System>, tool: Tool, warnings: &mut Vec<RegistryWarning>) {
        let original = tool.name.clone();
        let exposed = sanitize_function_name(&original);
        if exposed != original {
            warn!(system = %system.name(), tool = %original, exposed = %exposed, "renaming tool");
            warnings.push(RegistryWarning::Renamed {
                system: system.name().to_string(),
                original: original.clone(),
                renamed: exposed.clone(),
            });
        }

        let tool = Tool {
            name: exposed.clone(),
            ..tool
        };
        let route = Route {
            system: system.clone(),
            tool_name: original,
        };

        match self.routes.insert(exposed.clone(), route) {
            Some(previous) => {
                warn!(
                    tool = %exposed,
                    previous = %previous.system.name(),
                    system = %system.name(),
                    "tool name collision, keeping the later registration"
                );
                warnings.push(RegistryWarning::Collision {
                    tool: exposed.clone(),
                    previous: previous.system.name().to_string(),
                    system: system.name().to_string(),
                });
                if let Some(slot) = self.tools.iter_mut().find(|t| t.name == exposed) {
                    *slot = tool;
                }
            }
            None => self.tools.push(tool),
        }
    }
}

/// Incrementally assembles a [`ToolRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    registry: ToolRegistry,
    warnings: Vec<RegistryWarning>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handshake with an already connected system and register everything it lists
    pub async fn register(&mut self, system: Arc<dyn System>) {
        let result = discover(system.as_ref()).await;
        self.commit(system, result).await;
    }

    /// Note a system that could not even be connected
    pub fn record_failure(&mut self, name: &str, error: SystemError) {
        warn!(system = %name, error = %error, "failed to connect to system");
        self.warnings.push(RegistryWarning::Connection {
            system: name.to_string(),
            message: error.to_string(),
        });
    }

    pub fn finish(self) -> (ToolRegistry, Vec<RegistryWarning>) {
        info!(
            tools = self.registry.tools.len(),
            systems = self.registry.systems.len(),
            warnings = self.warnings.len(),
            "tool registry ready"
        );
        (self.registry, self.warnings)
    }

    async fn commit(&mut self, system: Arc<dyn System>, result: Result<Vec<Tool>, Discovery>) {
        match result {
            Ok(tools) => {
                debug!(system = %system.name(), tools = tools.len(), "registering tools");
                for tool in tools {
                    self.registry.insert(&system, tool, &mut self.warnings);
                }
                self.registry.systems.push(system);
            }
            Err(Discovery::Handshake(e)) => {
                warn!(system = %system.name(), error = %e, "handshake failed, excluding system");
                self.warnings.push(RegistryWarning::Connection {
                    system: system.name().to_string(),
                    message: e.to_string(),
                });
                if let Err(e) = system.shutdown().await {
                    debug!(system = %system.name(), error = %e, "failed to close excluded system");
                }
            }
            Err(Discovery::Listing(e)) => {
                warn!(system = %system.name(), error = %e, "tool listing failed");
                self.warnings.push(RegistryWarning::Listing {
                    system: system.name().to_string(),
                    message: e.to_string(),
                });
                // Still connected, so it is kept for shutdown
                self.registry.systems.push(system);
            }
        }
    }
}

enum Discovery {
    Handshake(SystemError),
    Listing(SystemError),
}

async fn discover(system: &dyn System) -> Result<Vec<Tool>, Discovery> {
    let capabilities = system.initialize().await.map_err(Discovery::Handshake)?;
    if !capabilities.supports_tools() {
        debug!(system = %system.name(), "system does not offer tools");
        return Ok(Vec::new());
    }
    drain_tools(system).await.map_err(Discovery::Listing)
}

/// Follow `tools/list` cursors until the last page
pub async fn drain_tools(system: &dyn System) -> Result<Vec<Tool>, SystemError> {
    let mut tools = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let page = system.list_tools(cursor.clone()).await?;
        let last = page.is_last();
        tools.extend(page.tools);
        if last {
            return Ok(tools);
        }

        let next = page.next_cursor.unwrap_or_default();
        if !seen.insert(next.clone()) {
            return Err(SystemError::Protocol(format!(
                "tools/list repeated cursor `{}`",
                next
            )));
        }
        cursor = Some(next);
    }

    Err(SystemError::Protocol(format!(
        "tools/list did not finish within {} pages",
        MAX_LIST_PAGES
    )))
}
