use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    /// Upper bound on one HTTP exchange; `None` leaves it to the caller's deadline
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl AnthropicProviderConfig {
    /// Config for the public endpoint and the default model
    pub fn new<S: Into<String>>(api_key: S) -> Self {
        Self {
            host: DEFAULT_ANTHROPIC_HOST.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            temperature: None,
            timeout: None,
        }
    }
}
