use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing setting `{field}`; add it to the config file or set {env_var}")]
    MissingSetting { field: String, env_var: String },

    #[error("No API key found; set ANTHROPIC_API_KEY (or API_KEY)")]
    MissingApiKey,

    #[error(transparent)]
    Other(#[from] config::ConfigError),
}

/// The environment variable that overrides a dotted config key
pub fn to_env_var(field: &str) -> String {
    let mut env_var = String::from("TETHER_");
    env_var.push_str(&field.replace('.', "__").to_uppercase());
    env_var
}
