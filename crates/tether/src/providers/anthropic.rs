use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::base::{ModelResponse, Provider, StopReason};
use super::configs::AnthropicProviderConfig;
use super::utils::{
    anthropic_response_to_message, get_usage, messages_to_anthropic_spec, tools_to_anthropic_spec,
};
use crate::models::message::Message;
use crate::models::tool::Tool;

pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn post(&self, payload: Value) -> Result<Value> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status => {
                let error_text = response.text().await.unwrap_or_default();
                Err(anyhow!("Request failed: {} - {}", status, error_text))
            }
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        max_tokens: u32,
    ) -> Result<ModelResponse> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_to_anthropic_spec(messages),
            "max_tokens": max_tokens,
        });

        if let Some(obj) = payload.as_object_mut() {
            if !system.is_empty() {
                obj.insert("system".to_string(), json!(system));
            }
            if !tools.is_empty() {
                obj.insert("tools".to_string(), json!(tools_to_anthropic_spec(tools)?));
            }
            if let Some(temp) = self.config.temperature {
                obj.insert("temperature".to_string(), json!(temp));
            }
        }

        let response = self.post(payload).await?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("Anthropic API error: {}", error));
        }

        let message = anthropic_response_to_message(&response)?;
        let stop_reason =
            StopReason::from_wire(response.get("stop_reason").and_then(|v| v.as_str()));
        let usage = get_usage(&response);

        tracing::debug!(
            model = %self.config.model,
            stop_reason = ?stop_reason,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            "model call completed"
        );

        Ok(ModelResponse {
            message,
            stop_reason,
            usage,
        })
    }
}
