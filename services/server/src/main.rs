//! Pulse cluster server entry point.
//!
//! Runs in two modes: the default router mode owns the public port,
//! the broadcast bus and the worker supervisor; the hidden `worker`
//! mode is what the supervisor re-executes this binary as, one process
//! per slot.

use anyhow::Context;
use clap::{Parser, Subcommand};
use pulse_server::supervisor::{default_worker_command, Supervisor};
use pulse_server::{session, BroadcastHub, ClusterConfig, ConnectionRouter};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pulse telemetry cluster server", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Public TCP bind address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Worker process count (0 = one per CPU core)
    #[arg(long)]
    workers: Option<usize>,

    /// Runtime directory for sockets and the config snapshot
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Internal: run as a worker process (spawned by the supervisor)
    #[command(hide = true)]
    Worker {
        /// Slot index assigned by the supervisor
        #[arg(long)]
        slot: usize,

        /// Config snapshot written by the router at boot
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_server=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = Args::parse();

    match args.mode.take() {
        Some(Mode::Worker { slot, config }) => run_worker(slot, config).await,
        None => run_router(args).await,
    }
}

/// Worker mode: load the router's config snapshot and serve handed-off
/// connections for one slot.
async fn run_worker(slot: usize, config_path: PathBuf) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config snapshot {}", config_path.display()))?;

    info!(slot, "Starting worker");
    session::run_worker(config, slot)
        .await
        .with_context(|| format!("Worker {} failed", slot))
}

/// Router mode: bus, supervisor and accept loop.
async fn run_router(args: Args) -> anyhow::Result<()> {
    info!("Starting Pulse cluster server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClusterConfig::default(),
    };
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(dir) = args.runtime_dir {
        config.runtime_dir = dir;
    }
    config.validate().context("Invalid configuration")?;

    let worker_count = config.effective_worker_count();
    info!(
        listen_addr = %config.listen_addr,
        workers = worker_count,
        runtime_dir = %config.runtime_dir.display(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.runtime_dir)
        .with_context(|| format!("Failed to create {}", config.runtime_dir.display()))?;
    std::fs::create_dir_all(&config.store_dir)
        .with_context(|| format!("Failed to create {}", config.store_dir.display()))?;

    // Workers load their configuration from this snapshot, so every
    // respawn sees the same effective settings as the router.
    config
        .write_to(config.snapshot_path())
        .context("Failed to write config snapshot")?;

    let hub = BroadcastHub::new(
        config.bus_socket(),
        config.bus_capacity,
        config.max_frame_bytes,
    );
    tokio::spawn(async move {
        if let Err(e) = hub.run().await {
            error!("Broadcast hub failed: {}", e);
        }
    });

    let command = default_worker_command(&config).context("Failed to resolve worker command")?;
    let supervisor = Supervisor::new(config.restart.clone(), command);
    supervisor.start(worker_count);

    let router = ConnectionRouter::new(config, worker_count);

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = router.run() => {
            if let Err(e) = result {
                error!("Connection router error: {}", e);
                return Err(e.into());
            }
        }
        _ = shutdown_signal => {
            info!("Shutting down cluster server");
        }
    }

    Ok(())
}
