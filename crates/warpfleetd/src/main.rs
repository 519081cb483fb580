//! warpfleetd: the WarpFleet daemon.
//!
//! Single binary that assembles the failover subsystems:
//! - State store (redb)
//! - Cluster health monitors
//! - Failover controller (taints, tolerations, rescheduling, purge)
//!
//! # Usage
//!
//! ```text
//! warpfleetd run --config /etc/warpfleet/warpfleet.toml --data-dir /var/lib/warpfleet
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use warpfleet_state::{SharedClock, StateStore, SystemClock};
use warpfleetd::FleetConfig;

#[derive(Parser)]
#[command(name = "warpfleetd", about = "WarpFleet failover daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the health monitors and the failover controller.
    Run {
        /// Path to warpfleet.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/warpfleet")]
        data_dir: PathBuf,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,warpfleetd=debug,warpfleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            in_memory,
            log_json,
        } => {
            init_tracing(log_json);
            run(config, data_dir, in_memory).await
        }
    }
}

async fn run(config_path: Option<PathBuf>, data_dir: PathBuf, in_memory: bool) -> anyhow::Result<()> {
    info!("WarpFleet daemon starting");

    let config = match &config_path {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };

    let state = if in_memory {
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&data_dir)?;
        let db_path = data_dir.join("warpfleet.redb");
        let state = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        state
    };

    let clock: SharedClock = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut daemon = tokio::spawn(warpfleetd::run(config, state, clock, shutdown_rx));

    tokio::select! {
        result = &mut daemon => {
            // Exited on its own, before any signal.
            result??;
            info!("WarpFleet daemon stopped");
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        },
    }
    let _ = shutdown_tx.send(true);

    daemon.await??;
    info!("WarpFleet daemon stopped");
    Ok(())
}
