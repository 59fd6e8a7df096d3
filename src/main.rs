//! # Burstcast — operator tool
//!
//! Inspects and maintains the target store the dispatch engine runs from.
//!
//! Usage:
//!   burstcast targets                 # List configured targets
//!   burstcast show <id>               # Print one target as JSON
//!   burstcast reset-running           # Clear every running flag
//!   burstcast init-config             # Write the default config file

use std::path::PathBuf;

use anyhow::{Context, Result};
use burstcast_core::{BurstcastConfig, ConfigStore, SqliteConfigStore, TargetKind};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "burstcast",
    version,
    about = "📣 Burstcast — bursty multi-target dispatch, operator tool"
)]
struct Cli {
    /// Config file (default: ~/.burstcast/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Target database, overrides the config file
    #[arg(long)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured targets
    Targets,
    /// Print one target's configuration as JSON
    Show { id: String },
    /// Clear the running flag of every target
    ResetRunning,
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "burstcast=debug,burstcast_core=debug,burstcast_dispatch=debug"
    } else {
        "burstcast=info,burstcast_core=info,burstcast_dispatch=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<BurstcastConfig> {
    let config = match &cli.config {
        Some(path) => BurstcastConfig::load_from(&expand_path(path))?,
        None => BurstcastConfig::load()?,
    };
    Ok(config)
}

fn open_store(cli: &Cli, config: &BurstcastConfig) -> Result<SqliteConfigStore> {
    let path = match &cli.db_path {
        Some(p) => expand_path(p),
        None => config.store.resolved_path(),
    };
    tracing::debug!("📂 Target store: {}", path.display());
    SqliteConfigStore::open(&path).with_context(|| format!("opening {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match &cli.command {
        Command::InitConfig { force } => {
            let path = cli
                .config
                .as_deref()
                .map(expand_path)
                .unwrap_or_else(BurstcastConfig::default_path);
            if path.exists() && !force {
                println!("⚠️  {} already exists (use --force to overwrite)", path.display());
                return Ok(());
            }
            BurstcastConfig::default().save_to(&path)?;
            println!("✅ Wrote default config to {}", path.display());
        }
        Command::Targets => {
            let config = load_config(&cli)?;
            let store = open_store(&cli, &config)?;
            let mut targets: Vec<_> = store.list()?.into_values().collect();
            if targets.is_empty() {
                println!("No targets configured.");
                return Ok(());
            }
            targets.sort_by(|a, b| a.name.cmp(&b.name));
            println!("{:<22} {:<24} {:<9} {:<8} {:<7} {}", "ID", "NAME", "KIND", "MODE", "VOTE", "STATE");
            for t in targets {
                let kind = match t.kind {
                    TargetKind::Channel => "channel",
                    TargetKind::Category => "category",
                };
                let mode = match (t.serial, t.is_timed()) {
                    (true, _) => "serial".to_string(),
                    (false, true) => format!("{}s", t.interval_secs),
                    (false, false) => "random".to_string(),
                };
                let vote = if t.vote_gate().is_some() { "yes" } else { "-" };
                let state = if t.running { "🟢 running" } else { "⚪ stopped" };
                println!("{:<22} {:<24} {:<9} {:<8} {:<7} {}", t.id, t.name, kind, mode, vote, state);
            }
        }
        Command::Show { id } => {
            let config = load_config(&cli)?;
            let store = open_store(&cli, &config)?;
            let target = store
                .get(id)?
                .with_context(|| format!("no target with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&target)?);
        }
        Command::ResetRunning => {
            let config = load_config(&cli)?;
            let store = open_store(&cli, &config)?;
            let cleared = store.reset_running()?;
            tracing::info!("🧹 Cleared running flag on {cleared} target(s)");
            println!("✅ {cleared} target(s) marked stopped");
        }
    }
    Ok(())
}
