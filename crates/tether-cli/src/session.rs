use anyhow::Result;
use std::path::PathBuf;

use crate::prompt::{InputType, Prompt};
use tether::agent::{Agent, AgentState, AgentUpdate};
use tether::models::role::Role;
use tether::registry::RegistryWarning;

pub struct Session<'a> {
    agent: Agent,
    prompt: Box<dyn Prompt + 'a>,
    log_file: PathBuf,
    /// Number of conversation messages already shown
    rendered: usize,
}

impl<'a> Session<'a> {
    pub fn new(agent: Agent, prompt: Box<dyn Prompt + 'a>, log_file: PathBuf) -> Self {
        Session {
            agent,
            prompt,
            log_file,
            rendered: 0,
        }
    }

    pub async fn start(&mut self, warnings: &[RegistryWarning]) -> Result<()> {
        self.setup_session(warnings);

        loop {
            let input = self.prompt.get_input()?;
            let started = match input.input_type {
                InputType::Message => match input.content {
                    Some(content) => self.agent.submit(content),
                    None => continue,
                },
                InputType::Retry => self.agent.retry(),
                InputType::Logs => {
                    self.show_logs();
                    continue;
                }
                InputType::Exit => break,
                InputType::AskAgain => continue,
            };
            if let Err(e) = started {
                self.prompt.error(&e.to_string());
                continue;
            }

            self.prompt.show_busy();
            self.process_turn().await;
            self.prompt.hide_busy();
        }

        self.close_session().await;
        Ok(())
    }

    /// Drive the agent until the turn ends, turning Ctrl-C into a cancel
    async fn process_turn(&mut self) {
        while self.agent.state() != AgentState::Idle {
            tokio::select! {
                update = self.agent.next_update() => {
                    match update {
                        Some(update) => self.handle_update(update),
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    if self.agent.cancel() {
                        self.render_new_messages();
                        self.prompt.notice(" Interrupt: the request was cancelled. Type /retry to send it again.");
                    }
                }
            }
        }
        self.render_new_messages();
    }

    fn handle_update(&mut self, update: AgentUpdate) {
        match update {
            AgentUpdate::Notification(notification) => {
                tracing::info!(
                    system = %notification.system,
                    method = %notification.method,
                    "notification"
                );
                self.prompt.notice(&format!(
                    "[{}] {}",
                    notification.system, notification.method
                ));
            }
            AgentUpdate::TurnFailed(e) => {
                self.render_new_messages();
                self.prompt.error(&e.to_string());
                if self.agent.can_retry() {
                    self.prompt.notice("Type /retry to try again.");
                }
            }
            AgentUpdate::ToolLimitReached => {
                self.render_new_messages();
                self.prompt
                    .notice("Stopped calling tools for this message. Send another message to continue.");
            }
            AgentUpdate::Stale | AgentUpdate::ToolResolved { .. } => {}
            AgentUpdate::ModelResponded { .. }
            | AgentUpdate::ToolsJoined
            | AgentUpdate::TurnComplete => self.render_new_messages(),
        }
    }

    /// Show messages appended since the last call, stopping at an unanswered placeholder
    fn render_new_messages(&mut self) {
        let messages = self.agent.conversation().messages();
        // A failed first model call withdraws the user's message
        self.rendered = self.rendered.min(messages.len());

        while let Some(message) = messages.get(self.rendered) {
            if message.is_pending() {
                break;
            }
            if message.role == Role::Assistant || message.tool_responses().next().is_some() {
                self.prompt.render(message);
            }
            self.rendered += 1;
        }
    }

    fn show_logs(&self) {
        match std::fs::read_to_string(&self.log_file) {
            Ok(logs) => println!("{}", logs),
            Err(e) => self.prompt.error(&format!(
                "Failed to read {}: {}",
                self.log_file.display(),
                e
            )),
        }
    }

    fn setup_session(&mut self, warnings: &[RegistryWarning]) {
        self.prompt.notice(&format!(
            "Starting session. Logging to {}",
            self.log_file.display()
        ));

        let registry = self.agent.registry();
        for system in registry.systems() {
            let tools: Vec<&str> = registry
                .tools()
                .iter()
                .filter(|tool| {
                    registry
                        .route(&tool.name)
                        .is_some_and(|route| route.system.name() == system.name())
                })
                .map(|tool| tool.name.as_str())
                .collect();
            self.prompt.notice(&format!(
                "Connected to `{}` ({}): {}",
                system.name(),
                system.transport(),
                if tools.is_empty() {
                    "no tools".to_string()
                } else {
                    tools.join(", ")
                }
            ));
        }
        for warning in warnings {
            self.prompt.error(&warning.to_string());
        }

        self.prompt.ready();
    }

    async fn close_session(&mut self) {
        self.prompt.notice("Closing session...");
        self.agent.shutdown().await;
        self.prompt.close();
    }
}
