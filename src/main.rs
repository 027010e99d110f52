use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};

use riptide::config::Config;
use riptide::daemon::protocol::{AccessMode, AccessModes, Selector, ShareView};
use riptide::daemon::{AgentClient, AgentLauncher};
use riptide::format::{human_bytes, relative_time, truncate};
use riptide::logging::{init_logging, LogConfig, Verbosity};

#[derive(Parser)]
#[command(name = "riptide")]
#[command(version)]
#[command(about = "Fast and easy file sharing over the internet, through a simple cli")]
#[command(
    long_about = "Share a local file over the internet for a limited time. Shares are served by a background agent, which is started automatically, as a wget-friendly link and a download page."
)]
struct Cli {
    /// File to share
    #[arg(conflicts_with_all = ["list", "remove", "reset_config"])]
    file: Option<PathBuf>,

    /// How many hours to share the file for (default from config, 24)
    #[arg(short, long, value_name = "HOURS", allow_negative_numbers = true)]
    time: Option<i64>,

    /// Name shown to people fetching the file (default: the file name)
    #[arg(short, long)]
    name: Option<String>,

    /// Disallow wget access, serving only the download page
    #[arg(long, conflicts_with = "restrict_website")]
    restrict_wget: bool,

    /// Disallow the download page, serving only wget access
    #[arg(long)]
    restrict_website: bool,

    /// List your active shares
    #[arg(short, long, conflicts_with_all = ["remove", "reset_config"])]
    list: bool,

    /// Remove a share by id or by its index in --list
    #[arg(short, long, value_name = "ID|INDEX")]
    remove: Option<String>,

    /// Remove every share and restore the default configuration
    #[arg(long, conflicts_with = "remove")]
    reset_config: bool,

    /// Don't ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,

    /// Don't copy the share link to the clipboard
    #[arg(long)]
    no_copy: bool,

    /// Increase log output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Config file to use
    #[arg(long, env = "RIPTIDE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Cli {
    fn access_modes(&self) -> AccessModes {
        if self.restrict_wget {
            AccessModes::only(AccessMode::Website)
        } else if self.restrict_website {
            AccessModes::only(AccessMode::Wget)
        } else {
            AccessModes::ALL
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(&LogConfig {
        verbosity: Verbosity::from_occurrences(cli.verbose),
        log_file: None,
    });

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path().context("Failed to locate config file")?,
    };
    let config = Config::load_from(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if cli.reset_config {
        return reset_config(&cli, &config, &config_path).await;
    }
    if cli.list {
        return list_shares(&config, &config_path).await;
    }
    if let Some(selector) = &cli.remove {
        return remove_share(selector, &config, &config_path).await;
    }
    match &cli.file {
        Some(file) => share_file(&cli, file, &config, &config_path).await,
        None => bail!("No file given. Run `riptide --help` for usage."),
    }
}

/// Connect to the agent, starting it with the same config file if needed.
async fn connect(config: &Config, config_path: &Path) -> Result<AgentClient> {
    let launcher = AgentLauncher {
        binary: None,
        config_path: Some(config_path.to_path_buf()),
    };
    AgentClient::connect_or_start(config.agent.effective_socket_path(), &launcher)
        .await
        .context("Failed to reach the riptide agent")
}

async fn share_file(cli: &Cli, file: &Path, config: &Config, config_path: &Path) -> Result<()> {
    // The agent runs in a different working directory
    let path = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(file)
    };

    let mut client = connect(config, config_path).await?;
    let share = client
        .add(
            path,
            cli.name.clone(),
            config.effective_hours(cli.time),
            cli.access_modes(),
        )
        .await
        .context("Failed to share file")?;

    println!("The file has been shared!");
    println!("  id:      {}", share.record.id);
    println!("  link:    {}", share.url);
    println!(
        "  expires: {} ({})",
        relative_time(share.record.expires_at, Utc::now()),
        share.record.expires_at.format("%Y-%m-%d %H:%M UTC")
    );
    println!("  access:  {}", share.record.modes);

    if !cli.no_copy {
        match copy_to_clipboard(&share.url) {
            Ok(()) => println!("The link has been copied to your clipboard."),
            Err(e) => {
                tracing::warn!("Clipboard unavailable: {}", e);
                eprintln!("Could not copy the link to the clipboard: {}", e);
            }
        }
    }
    Ok(())
}

fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new()?;
    clipboard.set_text(text.to_string())?;
    Ok(())
}

async fn list_shares(config: &Config, config_path: &Path) -> Result<()> {
    let mut client = connect(config, config_path).await?;
    let shares = client.list().await.context("Failed to list shares")?;

    if shares.is_empty() {
        println!("No active shares.");
        return Ok(());
    }

    print!("{}", format_share_table(&shares, Utc::now()));
    Ok(())
}

fn format_share_table(shares: &[ShareView], now: chrono::DateTime<Utc>) -> String {
    let mut table = format!(
        "{:<3} | {:<36} | {:<20} | {:<10} | {:<16} | {:<16} | {}\n",
        "#", "ID", "Name", "Size", "Created", "Expires", "Access"
    );
    table.push_str(&format!(
        "{:-<3}-+-{:-<36}-+-{:-<20}-+-{:-<10}-+-{:-<16}-+-{:-<16}-+-{:-<12}\n",
        "", "", "", "", "", "", ""
    ));

    for (index, share) in shares.iter().enumerate() {
        let record = &share.record;
        table.push_str(&format!(
            "{:<3} | {:<36} | {:<20} | {:<10} | {:<16} | {:<16} | {}\n",
            index,
            record.id,
            truncate(&record.name, 20),
            human_bytes(record.size),
            relative_time(record.created_at, now),
            relative_time(record.expires_at, now),
            record.modes,
        ));
    }
    table
}

async fn remove_share(selector: &str, config: &Config, config_path: &Path) -> Result<()> {
    let selector: Selector = selector.parse().map_err(anyhow::Error::msg)?;

    let mut client = connect(config, config_path).await?;
    let removed = client
        .remove(selector)
        .await
        .with_context(|| format!("Failed to remove share {}", selector))?;

    println!(
        "Removed share {} ({})",
        removed.record.id, removed.record.name
    );
    Ok(())
}

async fn reset_config(cli: &Cli, config: &Config, config_path: &Path) -> Result<()> {
    if !cli.yes {
        let confirmed = inquire::Confirm::new(
            "Remove every share and reset the configuration to its defaults?",
        )
        .with_default(false)
        .prompt()
        .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let mut client = connect(config, config_path).await?;
    let removed = client
        .reset_config()
        .await
        .context("Failed to reset configuration")?;

    println!(
        "Removed {} share(s) and reset {} to defaults.",
        removed,
        config_path.display()
    );
    println!("Restart the agent to apply a changed listener address.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::CommandFactory;
    use riptide::daemon::protocol::{ShareId, ShareRecord};

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_restrict_flags_conflict() {
        assert!(Cli::try_parse_from(["riptide", "a.txt", "--restrict-wget", "--restrict-website"]).is_err());

        let cli = Cli::try_parse_from(["riptide", "a.txt", "--restrict-wget"]).unwrap();
        assert_eq!(cli.access_modes(), AccessModes::only(AccessMode::Website));

        let cli = Cli::try_parse_from(["riptide", "a.txt", "--restrict-website"]).unwrap();
        assert_eq!(cli.access_modes(), AccessModes::only(AccessMode::Wget));
    }

    #[test]
    fn test_negative_time_is_parsed() {
        let cli = Cli::try_parse_from(["riptide", "a.txt", "-t", "-3"]).unwrap();
        assert_eq!(cli.time, Some(-3));
    }

    #[test]
    fn test_actions_conflict() {
        assert!(Cli::try_parse_from(["riptide", "a.txt", "--list"]).is_err());
        assert!(Cli::try_parse_from(["riptide", "--list", "--remove", "0"]).is_err());
        assert!(Cli::try_parse_from(["riptide", "--reset-config", "--remove", "0"]).is_err());
    }

    #[test]
    fn test_format_share_table() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let record = ShareRecord {
            id: ShareId::new(),
            owner: "uid:1000".to_string(),
            path: PathBuf::from("/tmp/report.pdf"),
            name: "report.pdf".to_string(),
            size: 50_000,
            file_type: "pdf".to_string(),
            created_at: now - chrono::Duration::minutes(5),
            expires_at: now + chrono::Duration::hours(2),
            modes: AccessModes::only(AccessMode::Wget),
            owned_copy: false,
        };
        let table = format_share_table(&[ShareView::new(record.clone(), "http://x")], now);

        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("0 "));
        assert!(lines[2].contains(&record.id.to_string()));
        assert!(lines[2].contains("48.83 KB"));
        assert!(lines[2].contains("5 minutes ago"));
        assert!(lines[2].contains("in 2 hours"));
        assert!(lines[2].ends_with("wget"));
    }
}
