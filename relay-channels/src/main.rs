//! Relay Channels - Main entry point.

use anyhow::{Context, Result};
use clap::Parser;
use relay_channels::{run, ChannelKind};
use relay_common::config::Config;
use relay_common::logging::init_logging_with_exclusions;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "relay-channels")]
#[command(version)]
#[command(about = "Relay chat threads to a coding assistant, one resumable session per thread.", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.relay/config.json)
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Sessions file, overriding the configured path
    #[arg(long)]
    sessions_file: Option<PathBuf>,

    /// Default working directory for new assistant sessions
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Chat surface to listen on
    #[arg(long, value_enum, default_value = "slack")]
    channel: ChannelKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_with_env(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(path) = &cli.sessions_file {
        config.sessions.path = Some(path.to_string_lossy().into_owned());
    }
    if let Some(dir) = &cli.working_dir {
        config.assistant.working_dir = Some(dir.to_string_lossy().into_owned());
    }

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Relay Channels v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate(cli.channel == ChannelKind::Slack)
        .context("Invalid configuration")?;

    run(&config, cli.channel).await
}
