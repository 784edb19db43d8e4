use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{ModelResponse, Provider, StopReason};

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Result<ModelResponse, String>>>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Result<ModelResponse, String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A response ending the turn with the given message
    pub fn reply(message: Message) -> Result<ModelResponse, String> {
        Ok(ModelResponse::new(message, StopReason::EndTurn))
    }

    /// A response asking for the tools requested in the message
    pub fn tool_use(message: Message) -> Result<ModelResponse, String> {
        Ok(ModelResponse::new(message, StopReason::ToolUse))
    }

    /// Every transcript this provider was called with, in call order
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        _system_prompt: &str,
        messages: &[Message],
        _tools: &[Tool],
        _max_tokens: u32,
    ) -> Result<ModelResponse> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Return empty response if no more pre-configured responses
            Ok(ModelResponse::new(
                Message::assistant().with_text(""),
                StopReason::EndTurn,
            ))
        } else {
            responses.remove(0).map_err(|e| anyhow!(e))
        }
    }
}
