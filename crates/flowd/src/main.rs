//! flowd: the flowgrid daemon.
//!
//! Single binary that assembles the flowgrid subsystems:
//! - Service pool (redb)
//! - Intent dispatcher in front of the LCM
//! - Auto-scaler
//! - Watchdog on the VM event bus
//! - REST API
//!
//! # Usage
//!
//! ```text
//! flowd run --config /etc/flowgrid/flowgrid.toml
//! flowd check-config --config /etc/flowgrid/flowgrid.toml
//! ```

mod daemon;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use flowgrid_core::FlowConfig;

const DEFAULT_LOG_FILTER: &str = "info,flowd=debug,flowgrid=debug";

#[derive(Parser)]
#[command(name = "flowd", about = "flowgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until Ctrl-C.
    Run {
        /// Path to flowgrid.toml. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse and validate configuration, then print the effective values.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FlowConfig> {
    match path {
        Some(path) => Ok(FlowConfig::from_file(path)?),
        None => {
            warn!("no --config given, using built-in defaults");
            Ok(FlowConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => {
            let config = load_config(config.as_deref())?;
            daemon::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            config.validate()?;
            config.role_defaults()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
