//! Command-line interface for the QNet HA node

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use qnet_ha::DataBackupManager;
use qnet_ledger::Ledger;
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;
use crate::node::HaNode;

/// QNet HA node CLI
#[derive(Parser, Debug)]
#[command(name = "qnet-ha-node")]
#[command(about = "QNet high-availability node", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Local node id
    #[arg(short, long)]
    pub node_id: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node
    Start,

    /// Print the effective configuration
    Config,

    /// Backup inspection
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum BackupCommands {
    /// List backups recorded in the manifest
    List,

    /// Check a backup's integrity hash and decode it
    Verify {
        /// Backup id
        backup_id: String,
    },
}

/// Parse CLI arguments
pub fn parse() -> Cli {
    Cli::parse()
}

/// Execute CLI command
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    init_logging(&cli.log_level)?;

    let mut config = NodeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.apply_overrides(cli.node_id, cli.data_dir);
    config.validate().context("invalid configuration")?;

    match cli.command {
        Some(Commands::Start) | None => cmd_start(config).await,
        Some(Commands::Config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Backups { command }) => cmd_backups(config, command).await,
    }
}

/// Initialize logging
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

/// Start node command
async fn cmd_start(config: NodeConfig) -> anyhow::Result<()> {
    println!("Starting QNet HA node...");
    println!("Node id: {}", config.ha.node_id);
    println!("Peers: {}", config.peers.len());
    println!("Backups: {}", config.ha.backup.directory.display());

    let mut node = HaNode::new(config)?;
    node.start().await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    println!("\nShutting down node...");
    node.stop().await?;
    Ok(())
}

/// Backup commands operate on the manifest without starting the node
async fn cmd_backups(config: NodeConfig, command: BackupCommands) -> anyhow::Result<()> {
    let manager = DataBackupManager::new(
        config.ha.node_id.clone(),
        config.ha.backup.clone(),
        Arc::new(Ledger::new()),
    );
    manager.load_manifest().await?;

    match command {
        BackupCommands::List => {
            let backups = manager.list_backups().await;
            if backups.is_empty() {
                println!("No backups in {}", manager.directory().display());
            }
            for record in backups {
                println!(
                    "{}  {}  {} bytes  height {}{}",
                    record.backup_id,
                    record.created_at.to_rfc3339(),
                    record.size_bytes,
                    record.height.map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
                    if record.is_compressed { "  lz4" } else { "" }
                );
            }
        }
        BackupCommands::Verify { backup_id } => {
            let state = manager.read_backup(&backup_id).await?;
            println!(
                "Backup {} OK: {} blocks, {} accounts",
                backup_id,
                state.blocks.len(),
                state.balances.len()
            );
        }
    }
    Ok(())
}
