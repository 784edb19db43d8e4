use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether::agent::{Agent, AgentOptions, AgentState, AgentUpdate, TurnError};
use tether::errors::{AgentError, AgentResult};
use tether::models::content::Content;
use tether::models::conversation::Conversation;
use tether::models::message::{Message, MessageContent};
use tether::models::role::Role;
use tether::models::tool::{Tool, ToolCall};
use tether::providers::base::{ModelResponse, Provider, StopReason};
use tether::registry::{RegistryBuilder, RegistryWarning, ToolRegistry};
use tether::systems::protocol::ServerCapabilities;
use tether::systems::{
    connect, NotificationSink, System, SystemConfig, SystemError, ToolPage, TransportKind,
};

/// Replays a fixed list of model responses and records every transcript it was sent
struct ScriptedProvider {
    responses: Mutex<Vec<Result<ModelResponse, String>>>,
    seen: Mutex<Vec<Vec<Message>>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<Result<ModelResponse, String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            seen: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
        })
    }

    /// Tool names advertised on each call, in call order
    fn offered_tools(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _system: &str,
        messages: &[Message],
        tools: &[Tool],
        _max_tokens: u32,
    ) -> Result<ModelResponse> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.offered
            .lock()
            .unwrap()
            .push(tools.iter().map(|tool| tool.name.clone()).collect());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(anyhow!("script exhausted"));
        }
        responses.remove(0).map_err(|e| anyhow!(e))
    }
}

fn text_reply(text: &str) -> Result<ModelResponse, String> {
    Ok(ModelResponse::new(
        Message::assistant().with_text(text),
        StopReason::EndTurn,
    ))
}

fn tool_use(calls: &[(&str, &str)]) -> Result<ModelResponse, String> {
    let message = calls.iter().fold(Message::assistant(), |message, (id, name)| {
        message.with_tool_request(*id, ToolCall::new(*name, json!({})))
    });
    Ok(ModelResponse::new(message, StopReason::ToolUse))
}

/// A system whose tools sleep for a fixed time and then return a fixed value
struct FakeSystem {
    name: String,
    tools: HashMap<String, (Duration, AgentResult<Vec<Content>>)>,
}

impl FakeSystem {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: HashMap::new(),
        }
    }

    fn tool(mut self, name: &str, delay_ms: u64, result: AgentResult<Vec<Content>>) -> Self {
        self.tools
            .insert(name.to_string(), (Duration::from_millis(delay_ms), result));
        self
    }
}

#[async_trait]
impl System for FakeSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn initialize(&self) -> Result<ServerCapabilities, SystemError> {
        Ok(ServerCapabilities {
            tools: Some(json!({})),
            ..Default::default()
        })
    }

    async fn list_tools(&self, _cursor: Option<String>) -> Result<ToolPage, SystemError> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        Ok(ToolPage {
            tools: names
                .into_iter()
                .map(|name| Tool::new(name.as_str(), "", json!({"type": "object"})))
                .collect(),
            next_cursor: None,
        })
    }

    async fn call(&self, tool_call: ToolCall) -> AgentResult<Vec<Content>> {
        let (delay, result) = self
            .tools
            .get(&tool_call.name)
            .cloned()
            .ok_or_else(|| AgentError::ToolNotFound(tool_call.name.clone()))?;
        tokio::time::sleep(delay).await;
        result
    }

    async fn shutdown(&self) -> Result<(), SystemError> {
        Ok(())
    }
}

async fn registry(systems: Vec<FakeSystem>) -> ToolRegistry {
    let mut builder = RegistryBuilder::new();
    for system in systems {
        builder.register(Arc::new(system)).await;
    }
    builder.finish().0
}

fn options() -> AgentOptions {
    AgentOptions {
        tool_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// Every tool request is answered, in order, by the message right after it
fn assert_paired(conversation: &Conversation) {
    let messages = conversation.messages();
    for (i, message) in messages.iter().enumerate() {
        let requested: Vec<&str> = message.tool_requests().map(|r| r.id.as_str()).collect();
        if requested.is_empty() {
            continue;
        }
        let answer = messages
            .get(i + 1)
            .unwrap_or_else(|| panic!("tool requests at {} have no answer", i));
        assert_eq!(answer.role, Role::User);
        let answered: Vec<&str> = answer.tool_responses().map(|r| r.id.as_str()).collect();
        assert_eq!(answered, requested, "answer to message {}", i);
    }
    assert!(conversation.unanswered_tool_uses().is_empty());
}

fn tool_results(message: &Message) -> Vec<(&str, &AgentResult<Vec<Content>>)> {
    message
        .tool_responses()
        .map(|r| (r.id.as_str(), &r.tool_result))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_get_coordinates_round_trip() {
    let coordinates: Value = json!({"long": -122.4194, "lat": 37.7749});
    let geo = FakeSystem::new("geo").tool(
        "get_coordinates",
        5,
        Ok(vec![Content::text(coordinates.to_string())]),
    );
    let provider = ScriptedProvider::new(vec![
        tool_use(&[("toolu_1", "get_coordinates")]),
        text_reply("You are in San Francisco."),
    ]);
    let mut agent = Agent::new(provider.clone(), registry(vec![geo]).await, options());

    agent.submit("Where am I?").unwrap();
    let updates = agent.run_until_idle().await;

    assert_eq!(
        updates,
        vec![
            AgentUpdate::ModelResponded { tool_calls: 1 },
            AgentUpdate::ToolsJoined,
            AgentUpdate::TurnComplete,
        ]
    );

    let messages = agent.conversation().messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].text(), "Where am I?");
    assert_eq!(messages[1].tool_requests().next().unwrap().id, "toolu_1");
    assert_eq!(
        messages[2].content[0].as_tool_response_text(),
        Some(coordinates.to_string())
    );
    assert_eq!(messages[3].text(), "You are in San Francisco.");
    assert_paired(agent.conversation());

    // The second model call saw the tool result and no placeholder
    let seen = provider.seen.lock().unwrap();
    assert_eq!(seen[1].len(), 3);
    assert!(seen.iter().flatten().all(|m| !m.is_pending()));
}

#[tokio::test(start_paused = true)]
async fn test_results_fold_in_emission_order() {
    let system = FakeSystem::new("abc")
        .tool("a", 20, Ok(vec![Content::text("A")]))
        .tool("b", 30, Ok(vec![Content::text("B")]))
        .tool("c", 10, Ok(vec![Content::text("C")]));
    let provider = ScriptedProvider::new(vec![
        tool_use(&[("1", "a"), ("2", "b"), ("3", "c")]),
        text_reply("done"),
    ]);
    let mut agent = Agent::new(provider, registry(vec![system]).await, options());

    agent.submit("go").unwrap();
    let updates = agent.run_until_idle().await;

    // Completion order is c, a, b
    assert_eq!(
        updates[1..3],
        [
            AgentUpdate::ToolResolved {
                tool_use_id: "3".to_string(),
                remaining: 2
            },
            AgentUpdate::ToolResolved {
                tool_use_id: "1".to_string(),
                remaining: 1
            },
        ]
    );

    let joined = &agent.conversation().messages()[2];
    let texts: Vec<_> = joined
        .content
        .iter()
        .filter_map(MessageContent::as_tool_response_text)
        .collect();
    assert_eq!(texts, vec!["A", "B", "C"]);
    assert_paired(agent.conversation());
}

#[tokio::test(start_paused = true)]
async fn test_tool_timeout_becomes_error_result() {
    let system = FakeSystem::new("slow")
        .tool("slow", 60_000, Ok(vec![Content::text("late")]))
        .tool("fast", 1, Ok(vec![Content::text("quick")]));
    let provider = ScriptedProvider::new(vec![
        tool_use(&[("1", "slow"), ("2", "fast")]),
        text_reply("the slow one timed out"),
    ]);
    let mut agent = Agent::new(provider, registry(vec![system]).await, options());

    agent.submit("go").unwrap();
    let updates = agent.run_until_idle().await;
    assert_eq!(updates.last(), Some(&AgentUpdate::TurnComplete));

    let results = tool_results(&agent.conversation().messages()[2]);
    assert_eq!(
        results[0],
        (
            "1",
            &Err(AgentError::Timeout {
                tool: "slow".to_string(),
                seconds: 10
            })
        )
    );
    assert_eq!(results[1], ("2", &Ok(vec![Content::text("quick")])));
    assert_paired(agent.conversation());
}

#[tokio::test(start_paused = true)]
async fn test_degraded_startup_keeps_working_systems() {
    let offline = SystemConfig::stdio("offline", "definitely-missing-tool-provider", vec![]);
    let mut builder = RegistryBuilder::new();
    match connect(&offline, NotificationSink::discard()) {
        Ok(_) => panic!("a missing binary should not connect"),
        Err(e) => builder.record_failure(&offline.name, e),
    }
    builder
        .register(Arc::new(FakeSystem::new("geo").tool(
            "get_coordinates",
            1,
            Ok(vec![Content::text("here")]),
        )))
        .await;
    let (registry, warnings) = builder.finish();

    assert_eq!(warnings.len(), 1);
    assert!(matches!(&warnings[0], RegistryWarning::Connection { system, .. } if system == "offline"));
    assert_eq!(registry.tools().len(), 1);

    let provider = ScriptedProvider::new(vec![
        tool_use(&[("1", "get_coordinates")]),
        text_reply("found you"),
    ]);
    let mut agent = Agent::new(provider.clone(), registry, options());
    agent.submit("Where am I?").unwrap();
    agent.run_until_idle().await;
    assert_eq!(agent.conversation().len(), 4);
    assert_paired(agent.conversation());

    // Only the surviving system's tools are ever offered to the model
    let offered = provider.offered_tools();
    assert_eq!(offered.len(), 2);
    assert!(offered.iter().all(|names| *names == vec!["get_coordinates".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_answers_unresolved_calls() {
    let system = FakeSystem::new("mixed")
        .tool("quick", 1, Ok(vec![Content::text("ok")]))
        .tool("slow_a", 5_000, Ok(vec![Content::text("late")]))
        .tool("slow_b", 5_000, Ok(vec![Content::text("late")]));
    let provider = ScriptedProvider::new(vec![
        tool_use(&[("1", "slow_a"), ("2", "quick"), ("3", "slow_b")]),
        text_reply("after cancel"),
    ]);
    let mut agent = Agent::new(provider.clone(), registry(vec![system]).await, options());

    agent.submit("go").unwrap();
    assert_eq!(
        agent.next_update().await,
        Some(AgentUpdate::ModelResponded { tool_calls: 3 })
    );
    assert_eq!(
        agent.next_update().await,
        Some(AgentUpdate::ToolResolved {
            tool_use_id: "2".to_string(),
            remaining: 2
        })
    );
    assert_eq!(agent.pending_calls().count(), 2);

    assert!(agent.cancel());
    assert_eq!(agent.state(), AgentState::Idle);
    assert_eq!(agent.pending_calls().count(), 0);

    let results = tool_results(agent.conversation().last().unwrap());
    assert_eq!(results.len(), 3);
    assert!(matches!(results[0], ("1", Err(AgentError::Cancelled(_)))));
    assert_eq!(results[1], ("2", &Ok(vec![Content::text("ok")])));
    assert!(matches!(results[2], ("3", Err(AgentError::Cancelled(_)))));
    assert_paired(agent.conversation());
    assert_eq!(provider.calls(), 1);

    // The cancelled units still report in, and are ignored
    agent.submit("what happened?").unwrap();
    let updates = agent.run_until_idle().await;
    assert_eq!(
        updates.iter().filter(|u| **u == AgentUpdate::Stale).count(),
        2
    );
    assert_eq!(updates.last(), Some(&AgentUpdate::TurnComplete));

    // The new text joined the trailing tool results instead of starting a second user message
    let messages = agent.conversation().messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].text(), "what happened?");
    assert_eq!(messages[3].text(), "after cancel");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_is_answered_without_dispatch() {
    let system = FakeSystem::new("geo").tool("get_coordinates", 1, Ok(vec![Content::text("here")]));
    let provider = ScriptedProvider::new(vec![
        tool_use(&[("1", "launch_rockets"), ("2", "get_coordinates")]),
        text_reply("ok"),
    ]);
    let mut agent = Agent::new(provider, registry(vec![system]).await, options());

    agent.submit("go").unwrap();
    let updates = agent.run_until_idle().await;
    assert_eq!(updates[0], AgentUpdate::ModelResponded { tool_calls: 2 });

    let results = tool_results(&agent.conversation().messages()[2]);
    assert_eq!(
        results[0],
        ("1", &Err(AgentError::ToolNotFound("launch_rockets".to_string())))
    );
    assert!(results[1].1.is_ok());
    assert_paired(agent.conversation());
}

#[tokio::test(start_paused = true)]
async fn test_only_unknown_tools_join_immediately() {
    let provider = ScriptedProvider::new(vec![tool_use(&[("1", "missing")]), text_reply("sorry")]);
    let mut agent = Agent::new(provider, registry(vec![]).await, options());

    agent.submit("go").unwrap();
    let updates = agent.run_until_idle().await;
    assert_eq!(
        updates,
        vec![AgentUpdate::ToolsJoined, AgentUpdate::TurnComplete]
    );
    assert_paired(agent.conversation());
}

#[tokio::test(start_paused = true)]
async fn test_tool_turn_limit() {
    let system = FakeSystem::new("loop").tool("again", 1, Ok(vec![Content::text("more")]));
    let provider = ScriptedProvider::new(vec![
        tool_use(&[("1", "again")]),
        tool_use(&[("2", "again")]),
        tool_use(&[("3", "again"), ("4", "again")]),
    ]);
    let mut agent = Agent::new(
        provider.clone(),
        registry(vec![system]).await,
        AgentOptions {
            max_tool_turns: 2,
            ..options()
        },
    );

    agent.submit("loop forever").unwrap();
    let updates = agent.run_until_idle().await;
    assert_eq!(updates.last(), Some(&AgentUpdate::ToolLimitReached));
    assert_eq!(provider.calls(), 3);

    let messages = agent.conversation().messages();
    let refused = tool_results(&messages[messages.len() - 2]);
    assert_eq!(refused.len(), 2);
    assert!(refused.iter().all(|(_, result)| result.is_err()));
    assert_eq!(messages.last().unwrap().role, Role::Assistant);
    assert_paired(agent.conversation());
}

#[tokio::test(start_paused = true)]
async fn test_model_failure_after_tools_can_be_reissued() {
    let system = FakeSystem::new("geo").tool("get_coordinates", 1, Ok(vec![Content::text("here")]));
    let provider = ScriptedProvider::new(vec![
        tool_use(&[("1", "get_coordinates")]),
        Err("overloaded".to_string()),
        text_reply("You are here."),
    ]);
    let mut agent = Agent::new(provider.clone(), registry(vec![system]).await, options());

    agent.submit("Where am I?").unwrap();
    let updates = agent.run_until_idle().await;
    match updates.last() {
        Some(AgentUpdate::TurnFailed(TurnError::Model { input, .. })) => assert!(input.is_none()),
        other => panic!("unexpected {:?}", other),
    }
    // The tool round survives, only the placeholder is gone
    assert_eq!(agent.conversation().len(), 3);
    assert!(!agent.conversation().has_pending());

    agent.retry().unwrap();
    agent.run_until_idle().await;
    assert_eq!(agent.conversation().len(), 4);
    assert_eq!(provider.calls(), 3);
    assert_paired(agent.conversation());
}

#[tokio::test(start_paused = true)]
async fn test_model_timeout() {
    struct Silent;

    #[async_trait]
    impl Provider for Silent {
        async fn complete(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[Tool],
            _max_tokens: u32,
        ) -> Result<ModelResponse> {
            std::future::pending().await
        }
    }

    let mut agent = Agent::new(
        Arc::new(Silent),
        registry(vec![]).await,
        AgentOptions {
            model_timeout: Duration::from_secs(600),
            ..options()
        },
    );
    agent.submit("hello?").unwrap();
    let updates = agent.run_until_idle().await;
    match &updates[..] {
        [AgentUpdate::TurnFailed(TurnError::Model { message, input })] => {
            assert!(message.contains("600s"));
            assert_eq!(input.as_deref(), Some("hello?"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(agent.conversation().is_empty());
}
