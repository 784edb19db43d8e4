use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::conversation::{Conversation, ConversationError, TurnId};
use crate::models::message::{Message, MessageContent, ToolRequest, ToolResponse};
use crate::models::tool::{Tool, ToolCall};
use crate::providers::base::{ModelResponse, Provider};
use crate::registry::ToolRegistry;
use crate::runner::{Outcome, TaskHandle, TaskRunner, UnitId};
use crate::systems::{Notification, NotificationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AgentState {
    Idle,
    AwaitingModel,
    Responding,
    AwaitingTools,
}

/// A message in the agent's inbox
#[derive(Debug)]
pub enum AgentEvent {
    Model {
        unit: UnitId,
        turn: TurnId,
        outcome: Outcome<anyhow::Result<ModelResponse>>,
    },
    Tool {
        unit: UnitId,
        turn: TurnId,
        outcome: Outcome<AgentResult<Vec<Content>>>,
    },
    Notification(Notification),
}

/// What processing one inbox message did
#[derive(Debug, Clone, PartialEq)]
pub enum AgentUpdate {
    /// The model asked for tools, which are now running
    ModelResponded { tool_calls: usize },
    ToolResolved {
        tool_use_id: String,
        remaining: usize,
    },
    /// Every tool of the turn resolved and the model was called again
    ToolsJoined,
    TurnComplete,
    ToolLimitReached,
    TurnFailed(TurnError),
    Notification(Notification),
    /// A completion from a cancelled unit or an earlier turn, ignored
    Stale,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TurnError {
    #[error("Still working on the previous message ({0})")]
    Busy(AgentState),

    /// `input` is the text withdrawn from the conversation, if any
    #[error("Model call failed: {message}")]
    Model {
        message: String,
        input: Option<String>,
    },

    #[error("There is nothing to retry")]
    NothingToRetry,

    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub system_prompt: String,
    pub max_tokens: u32,
    pub model_timeout: Duration,
    pub tool_timeout: Duration,
    /// Consecutive tool turns allowed for one user message
    pub max_tool_turns: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_tokens: 1024,
            model_timeout: Duration::from_secs(600),
            tool_timeout: Duration::from_secs(10),
            max_tool_turns: 25,
        }
    }
}

/// The runner and inbox an agent will use
///
/// Created ahead of the agent so systems can be wired to deliver their
/// notifications into the same inbox as tool completions.
pub struct AgentChannel {
    runner: TaskRunner<AgentEvent>,
    inbox: mpsc::UnboundedReceiver<AgentEvent>,
}

impl AgentChannel {
    pub fn new() -> Self {
        let (runner, inbox) = TaskRunner::new();
        Self { runner, inbox }
    }

    pub fn notification_sink(&self) -> NotificationSink {
        let sender = self.runner.sender();
        NotificationSink::new(move |notification| {
            let _ = sender.send(AgentEvent::Notification(notification));
        })
    }
}

impl Default for AgentChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// A tool call that has been dispatched and not yet resolved
#[derive(Debug)]
pub struct PendingCall {
    pub tool_use_id: String,
    pub tool: String,
    pub system: String,
    /// Position of the request among the tool requests of its message
    pub index: usize,
    pub deadline: Instant,
    pub handle: TaskHandle,
}

/// Results of one turn's tool calls, kept in emission order
#[derive(Debug)]
struct ToolJoin {
    turn: TurnId,
    slots: Vec<Option<ToolResponse>>,
    pending: HashMap<UnitId, PendingCall>,
}

impl ToolJoin {
    fn new(turn: TurnId, size: usize) -> Self {
        Self {
            turn,
            slots: vec![None; size],
            pending: HashMap::new(),
        }
    }

    fn resolve(&mut self, index: usize, response: ToolResponse) {
        self.slots[index] = Some(response);
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.slots.iter().all(Option::is_some)
    }

    fn into_message(self) -> Message {
        self.slots
            .into_iter()
            .flatten()
            .fold(Message::user(), |message, response| {
                message.with_content(MessageContent::ToolResponse(response))
            })
    }
}

#[derive(Debug, Clone)]
struct Submission {
    text: String,
    /// The text was appended to a trailing tool result message instead of a new one
    merged: bool,
}

#[derive(Debug, Clone)]
enum Retry {
    Resubmit(String),
    Reissue,
}

/// Drives the conversation between the model and the registered tools
///
/// All state changes happen on the caller's task while it processes inbox
/// messages through [`Agent::next_update`]; model and tool calls run on their own
/// tasks and only report back through the inbox.
pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: ToolRegistry,
    tools: Arc<[Tool]>,
    options: AgentOptions,
    runner: TaskRunner<AgentEvent>,
    inbox: mpsc::UnboundedReceiver<AgentEvent>,
    conversation: Conversation,
    state: AgentState,
    turn: TurnId,
    tool_turns: usize,
    model_call: Option<TaskHandle>,
    join: Option<ToolJoin>,
    submission: Option<Submission>,
    retry: Option<Retry>,
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>, registry: ToolRegistry, options: AgentOptions) -> Self {
        Self::with_channel(AgentChannel::new(), provider, registry, options)
    }

    pub fn with_channel(
        channel: AgentChannel,
        provider: Arc<dyn Provider>,
        registry: ToolRegistry,
        options: AgentOptions,
    ) -> Self {
        let tools: Arc<[Tool]> = registry.tools().to_vec().into();
        Self {
            provider,
            registry,
            tools,
            options,
            runner: channel.runner,
            inbox: channel.inbox,
            conversation: Conversation::new(),
            state: AgentState::Idle,
            turn: TurnId::default(),
            tool_turns: 0,
            model_call: None,
            join: None,
            submission: None,
            retry: None,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Tool calls of the current turn that have not resolved yet
    pub fn pending_calls(&self) -> impl Iterator<Item = &PendingCall> {
        self.join.iter().flat_map(|join| join.pending.values())
    }

    pub fn can_retry(&self) -> bool {
        self.retry.is_some()
    }

    /// Start a turn with the user's text
    pub fn submit<S: Into<String>>(&mut self, text: S) -> Result<(), TurnError> {
        if self.state != AgentState::Idle {
            return Err(TurnError::Busy(self.state));
        }
        let text = text.into();

        // Roles must alternate, so text typed after cancelled tools joins their results
        let merged = self
            .conversation
            .last()
            .is_some_and(Message::is_tool_results);
        if merged {
            if let Some(last) = self.conversation.last_mut() {
                last.content.push(MessageContent::text(text.clone()));
            }
        } else {
            self.conversation.push(Message::user().with_text(text.clone()));
        }

        self.turn = self.turn.next();
        self.tool_turns = 0;
        self.retry = None;
        self.submission = Some(Submission { text, merged });
        info!(turn = %self.turn, "user message submitted");

        if let Err(e) = self.start_model_call() {
            self.withdraw_submission();
            return Err(e);
        }
        Ok(())
    }

    /// Repeat whatever failed last: the whole submission, or the model call after a tool join
    pub fn retry(&mut self) -> Result<(), TurnError> {
        if self.state != AgentState::Idle {
            return Err(TurnError::Busy(self.state));
        }
        match self.retry.take() {
            None => Err(TurnError::NothingToRetry),
            Some(Retry::Resubmit(text)) => self.submit(text),
            Some(Retry::Reissue) => {
                self.turn = self.turn.next();
                info!(turn = %self.turn, "re-issuing model call");
                self.start_model_call().map_err(|e| {
                    self.retry = Some(Retry::Reissue);
                    e
                })
            }
        }
    }

    /// Wait for the next inbox message and apply it
    ///
    /// Returns `None` only if the inbox is closed. While idle with nothing in
    /// flight this waits for a notification, which may never come.
    pub async fn next_update(&mut self) -> Option<AgentUpdate> {
        let event = self.inbox.recv().await?;
        Some(self.handle(event))
    }

    /// Process inbox messages until the current turn ends
    pub async fn run_until_idle(&mut self) -> Vec<AgentUpdate> {
        let mut updates = Vec::new();
        while self.state != AgentState::Idle {
            match self.next_update().await {
                Some(update) => updates.push(update),
                None => break,
            }
        }
        updates
    }

    /// Abandon the current turn, leaving every tool request answered
    ///
    /// Returns false if there was nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            AgentState::AwaitingModel => {
                if let Some(handle) = self.model_call.take() {
                    handle.cancel();
                }
                if let Err(e) = self.conversation.discard_pending(self.turn) {
                    warn!(error = %e, "no placeholder to discard on cancel");
                }
                self.set_retry_after_model_stop();
                self.transition(AgentState::Idle);
                info!(turn = %self.turn, "model call cancelled");
                true
            }
            AgentState::AwaitingTools => {
                if let Some(mut join) = self.join.take() {
                    let pending: Vec<PendingCall> =
                        join.pending.drain().map(|(_, call)| call).collect();
                    for call in pending {
                        call.handle.cancel();
                        let result = Err(AgentError::Cancelled(format!(
                            "`{}` was cancelled before it finished",
                            call.tool
                        )));
                        join.resolve(
                            call.index,
                            ToolResponse {
                                id: call.tool_use_id,
                                tool_result: result,
                            },
                        );
                    }
                    self.conversation.push(join.into_message());
                }
                self.retry = Some(Retry::Reissue);
                self.transition(AgentState::Idle);
                info!(turn = %self.turn, "tool calls cancelled");
                true
            }
            AgentState::Idle | AgentState::Responding => false,
        }
    }

    /// Cancel anything in flight and close every system connection
    pub async fn shutdown(&mut self) {
        self.cancel();
        self.registry.shutdown().await;
    }

    fn handle(&mut self, event: AgentEvent) -> AgentUpdate {
        match event {
            AgentEvent::Model {
                unit,
                turn,
                outcome,
            } => {
                let current = self.model_call.as_ref().map(TaskHandle::id);
                if current != Some(unit) || turn != self.turn {
                    debug!(unit = %unit, turn = %turn, "discarding stale model completion");
                    return AgentUpdate::Stale;
                }
                self.model_call = None;

                match outcome {
                    Outcome::Finished(Ok(response)) => self.on_model_response(response),
                    Outcome::Finished(Err(e)) => self.on_model_failure(format!("{:#}", e)),
                    Outcome::TimedOut(after) => self.on_model_failure(format!(
                        "model did not answer within {}s",
                        after.as_secs()
                    )),
                    Outcome::Cancelled => self.on_model_failure("model call cancelled".to_string()),
                }
            }
            AgentEvent::Tool {
                unit,
                turn,
                outcome,
            } => self.on_tool_outcome(unit, turn, outcome),
            AgentEvent::Notification(notification) => {
                debug!(
                    system = %notification.system,
                    method = %notification.method,
                    "notification from system"
                );
                AgentUpdate::Notification(notification)
            }
        }
    }

    fn on_model_response(&mut self, response: ModelResponse) -> AgentUpdate {
        let requests: Vec<ToolRequest> = response.message.tool_requests().cloned().collect();

        if let Err(e) = self.conversation.fill_pending(self.turn, response.message) {
            error!(error = %e, "model reply has no placeholder to fill");
            self.transition(AgentState::Idle);
            return AgentUpdate::TurnFailed(e.into());
        }

        if requests.is_empty() {
            if response.stop_reason.is_tool_use() {
                warn!(turn = %self.turn, "model stopped for tool use without requesting any tool");
            }
            self.transition(AgentState::Responding);
            self.submission = None;
            self.transition(AgentState::Idle);
            return AgentUpdate::TurnComplete;
        }

        if !response.stop_reason.is_tool_use() {
            warn!(
                turn = %self.turn,
                stop_reason = ?response.stop_reason,
                "model requested tools without stopping for tool use, dispatching anyway"
            );
        }

        if self.tool_turns >= self.options.max_tool_turns {
            return self.refuse_tools(requests);
        }
        self.tool_turns += 1;

        let tool_calls = requests.len();
        self.dispatch_tools(requests);
        if self.join.as_ref().is_some_and(ToolJoin::is_complete) {
            // Nothing was dispatched, every request was answered on the spot
            return self.finish_join();
        }
        AgentUpdate::ModelResponded { tool_calls }
    }

    fn dispatch_tools(&mut self, requests: Vec<ToolRequest>) {
        let turn = self.turn;
        let mut join = ToolJoin::new(turn, requests.len());

        for (index, request) in requests.into_iter().enumerate() {
            let name = request.tool_call.name.clone();
            let route = match self.registry.route(&name) {
                Some(route) => route.clone(),
                None => {
                    warn!(tool = %name, tool_use_id = %request.id, "model requested an unknown tool");
                    join.resolve(
                        index,
                        ToolResponse {
                            id: request.id,
                            tool_result: Err(AgentError::ToolNotFound(name)),
                        },
                    );
                    continue;
                }
            };

            let system = route.system.clone();
            let call = ToolCall::new(route.tool_name.clone(), request.tool_call.arguments);
            let deadline = self.options.tool_timeout;
            info!(tool = %name, system = %system.name(), tool_use_id = %request.id, "dispatching tool call");

            let handle = self.runner.spawn(
                Some(deadline),
                async move { system.call(call).await },
                move |unit, outcome| AgentEvent::Tool {
                    unit,
                    turn,
                    outcome,
                },
            );
            join.pending.insert(
                handle.id(),
                PendingCall {
                    tool_use_id: request.id,
                    tool: name,
                    system: route.system.name().to_string(),
                    index,
                    deadline: Instant::now() + deadline,
                    handle,
                },
            );
        }

        self.join = Some(join);
        self.transition(AgentState::AwaitingTools);
    }

    fn on_tool_outcome(
        &mut self,
        unit: UnitId,
        turn: TurnId,
        outcome: Outcome<AgentResult<Vec<Content>>>,
    ) -> AgentUpdate {
        let join = match self.join.as_mut() {
            Some(join) if join.turn == turn => join,
            _ => {
                debug!(unit = %unit, turn = %turn, "discarding stale tool completion");
                return AgentUpdate::Stale;
            }
        };
        let call = match join.pending.remove(&unit) {
            Some(call) => call,
            None => {
                debug!(unit = %unit, "discarding completion for an unknown tool call");
                return AgentUpdate::Stale;
            }
        };

        let tool_result = match outcome {
            Outcome::Finished(result) => result,
            Outcome::TimedOut(after) => {
                warn!(tool = %call.tool, system = %call.system, "tool call timed out");
                Err(AgentError::Timeout {
                    tool: call.tool.clone(),
                    seconds: after.as_secs(),
                })
            }
            Outcome::Cancelled => Err(AgentError::Cancelled(format!(
                "`{}` was cancelled before it finished",
                call.tool
            ))),
        };
        if let Err(e) = &tool_result {
            debug!(tool = %call.tool, error = %e, "tool call failed");
        }

        let tool_use_id = call.tool_use_id.clone();
        join.resolve(
            call.index,
            ToolResponse {
                id: call.tool_use_id,
                tool_result,
            },
        );

        if join.is_complete() {
            self.finish_join()
        } else {
            AgentUpdate::ToolResolved {
                tool_use_id,
                remaining: join.pending.len(),
            }
        }
    }

    fn finish_join(&mut self) -> AgentUpdate {
        let join = match self.join.take() {
            Some(join) => join,
            None => return AgentUpdate::Stale,
        };
        self.conversation.push(join.into_message());

        match self.start_model_call() {
            Ok(()) => AgentUpdate::ToolsJoined,
            Err(e) => {
                error!(error = %e, "could not call the model after tools resolved");
                self.retry = Some(Retry::Reissue);
                self.transition(AgentState::Idle);
                AgentUpdate::TurnFailed(e)
            }
        }
    }

    /// Answer every request with an error and end the turn
    fn refuse_tools(&mut self, requests: Vec<ToolRequest>) -> AgentUpdate {
        let limit = self.options.max_tool_turns;
        warn!(turn = %self.turn, limit, "tool turn limit reached");

        let results = requests.into_iter().fold(Message::user(), |message, request| {
            message.with_tool_response(
                request.id,
                Err(AgentError::ExecutionError(format!(
                    "Tool turn limit of {} reached, the call was not made",
                    limit
                ))),
            )
        });
        self.conversation.push(results);
        self.conversation.push(Message::assistant().with_text(format!(
            "I stopped after {} consecutive rounds of tool calls without reaching an answer.",
            limit
        )));

        self.submission = None;
        self.transition(AgentState::Idle);
        AgentUpdate::ToolLimitReached
    }

    fn on_model_failure(&mut self, message: String) -> AgentUpdate {
        error!(turn = %self.turn, error = %message, "model call failed");
        if let Err(e) = self.conversation.discard_pending(self.turn) {
            warn!(error = %e, "no placeholder to discard after model failure");
        }
        let input = self.set_retry_after_model_stop();
        self.transition(AgentState::Idle);
        AgentUpdate::TurnFailed(TurnError::Model { message, input })
    }

    /// After the model call of a turn stopped without an answer, decide what `retry` does.
    /// Returns the withdrawn user text, if any.
    fn set_retry_after_model_stop(&mut self) -> Option<String> {
        if self.tool_turns == 0 {
            let text = self.withdraw_submission();
            self.retry = text.clone().map(Retry::Resubmit);
            text
        } else {
            self.retry = Some(Retry::Reissue);
            None
        }
    }

    fn withdraw_submission(&mut self) -> Option<String> {
        let submission = self.submission.take()?;
        if submission.merged {
            if let Some(last) = self.conversation.last_mut() {
                if matches!(last.content.last(), Some(MessageContent::Text(_))) {
                    last.content.pop();
                }
            }
        } else {
            self.conversation.withdraw_last_user();
        }
        Some(submission.text)
    }

    fn start_model_call(&mut self) -> Result<(), TurnError> {
        self.conversation.open_pending(self.turn)?;

        let messages = self.conversation.snapshot();
        let provider = self.provider.clone();
        let tools = self.tools.clone();
        let system = self.options.system_prompt.clone();
        let max_tokens = self.options.max_tokens;
        let turn = self.turn;

        debug!(turn = %turn, messages = messages.len(), tools = tools.len(), "calling model");
        let handle = self.runner.spawn(
            Some(self.options.model_timeout),
            async move {
                provider
                    .complete(&system, &messages, &tools, max_tokens)
                    .await
            },
            move |unit, outcome| AgentEvent::Model {
                unit,
                turn,
                outcome,
            },
        );
        self.model_call = Some(handle);
        self.transition(AgentState::AwaitingModel);
        Ok(())
    }

    fn transition(&mut self, to: AgentState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, turn = %self.turn, "state transition");
            self.state = to;
        }
    }
}
