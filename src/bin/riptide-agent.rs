use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

use riptide::config::Config;
use riptide::daemon::Agent;
use riptide::logging::{init_logging, LogConfig, Verbosity};

#[derive(Parser)]
#[command(name = "riptide-agent")]
#[command(version)]
#[command(about = "Background agent holding riptide shares and serving them over HTTP")]
struct AgentCli {
    /// Config file to use
    #[arg(long, env = "RIPTIDE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Also write debug logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AgentCli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path().context("Failed to locate config file")?,
    };
    let config = Config::load_from(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let _log_guard = init_logging(&LogConfig {
        verbosity: Verbosity::from_occurrences(cli.verbose.max(1)),
        log_file: cli.log_file.or_else(|| config.logging.log_file.clone()),
    });
    tracing::info!(config = %config_path.display(), "Starting riptide agent");

    let handle = Agent::new(config, Some(config_path))
        .start()
        .await
        .context("Failed to start agent")?;
    handle.run_until_shutdown().await;
    Ok(())
}
