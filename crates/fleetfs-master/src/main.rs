#![warn(missing_docs)]

//! fleetfs master daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fleetfs_master::{MasterConfig, MasterDaemon};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "fleetfs-master", about = "fleetfs master: storage node registry and namespace")]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(short, long, env = "FLEETFS_MASTER_CONFIG")]
    config: Option<PathBuf>,

    /// Address nodes connect to; overrides the config file.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Metadata directory; overrides the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) if path.exists() => MasterConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            MasterConfig::default()
        }
        None => MasterConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!(data_dir = %config.data_dir.display(), "fleetfs master starting");
    let mut daemon = MasterDaemon::open(config)?;
    let addr = daemon.start().await?;
    tracing::info!(%addr, "listening for storage nodes");

    tokio::signal::ctrl_c().await?;
    daemon.shutdown().await;
    Ok(())
}
