use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod configuration;
mod error;
mod logging;
mod prompt;
mod session;

use configuration::Settings;
use prompt::rustyline::RustylinePrompt;
use session::Session;
use tether::agent::{Agent, AgentChannel};
use tether::providers::anthropic::AnthropicProvider;
use tether::registry::ToolRegistry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file listing the tool servers (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File the session log is written to
    #[arg(long, default_value = "session.log")]
    log_file: PathBuf,

    /// Token budget for each model response, overriding the config file
    #[arg(long)]
    max_tokens: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();
    logging::init_file_logging(&cli.log_file)?;

    let mut settings =
        Settings::new(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(max_tokens) = cli.max_tokens {
        settings.max_tokens = max_tokens;
    }
    let api_key = configuration::api_key()?;
    let provider = AnthropicProvider::new(settings.provider_config(api_key))?;

    let spin = cliclack::spinner();
    spin.start("Connecting to tool servers...");
    let channel = AgentChannel::new();
    let (registry, warnings) =
        ToolRegistry::build(&settings.servers, channel.notification_sink()).await;
    spin.stop(format!(
        "Connected to {} of {} servers, {} tools available",
        registry.systems().len(),
        settings.servers.len(),
        registry.tools().len()
    ));

    let agent = Agent::with_channel(
        channel,
        Arc::new(provider),
        registry,
        settings.agent_options(),
    );
    let prompt = RustylinePrompt::new()?;
    let mut session = Session::new(agent, Box::new(prompt), cli.log_file);
    session.start(&warnings).await
}
