use crate::error::{to_env_var, ConfigError};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use tether::agent::AgentOptions;
use tether::providers::configs::{
    AnthropicProviderConfig, DEFAULT_ANTHROPIC_HOST, DEFAULT_ANTHROPIC_MODEL,
};
use tether::systems::SystemConfig;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize)]
pub struct ModelSettings {
    pub model: String,
    pub host: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    pub tool_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub max_tool_turns: usize,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub max_tokens: u32,
    pub model: ModelSettings,
    pub agent: AgentSettings,
    #[serde(default)]
    pub servers: Vec<SystemConfig>,
}

impl Settings {
    /// Load settings from `path` (or `config.toml` if it exists) and `TETHER_*` overrides
    pub fn new(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };

        let config = Config::builder()
            .set_default("max_tokens", 1024)?
            .set_default("model.model", DEFAULT_ANTHROPIC_MODEL)?
            .set_default("model.host", DEFAULT_ANTHROPIC_HOST)?
            .set_default("agent.tool_timeout_secs", 10)?
            .set_default("agent.model_timeout_secs", 600)?
            .set_default("agent.max_tool_turns", 25)?
            .add_source(file)
            .add_source(
                Environment::with_prefix("TETHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .trim_end_matches('`')
                        .to_string();
                    let env_var = to_env_var(&field);
                    Err(ConfigError::MissingSetting { field, env_var })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingSetting {
                        field: field.clone(),
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }

    pub fn provider_config(&self, api_key: String) -> AnthropicProviderConfig {
        AnthropicProviderConfig {
            host: self.model.host.clone(),
            api_key,
            model: self.model.model.clone(),
            temperature: self.model.temperature,
            timeout: Some(Duration::from_secs(self.agent.model_timeout_secs)),
        }
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            system_prompt: self.agent.system_prompt.clone(),
            max_tokens: self.max_tokens,
            model_timeout: Duration::from_secs(self.agent.model_timeout_secs),
            tool_timeout: Duration::from_secs(self.agent.tool_timeout_secs),
            max_tool_turns: self.agent.max_tool_turns,
        }
    }
}

/// The Anthropic key, from `ANTHROPIC_API_KEY` or the older `API_KEY`
pub fn api_key() -> Result<String, ConfigError> {
    ["ANTHROPIC_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|key| !key.trim().is_empty())
        .ok_or(ConfigError::MissingApiKey)
}
