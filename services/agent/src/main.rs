//! Pulse monitoring agent entry point.

use clap::Parser;
use pulse_agent::{AgentConfig, SystemSource};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pulse monitoring agent", long_about = None)]
struct Args {
    /// Cluster router address
    #[arg(short, long, default_value = "127.0.0.1:7711")]
    server: String,

    /// Seconds between samples
    #[arg(long, default_value_t = 1)]
    tick_secs: u64,

    /// Milliseconds between the two CPU snapshots of one sample
    #[arg(long, default_value_t = 180)]
    load_window_ms: u64,

    /// Seconds between reconnect attempts
    #[arg(long, default_value_t = 2)]
    reconnect_secs: u64,

    /// Report under this hardware id instead of the detected MAC
    #[arg(long)]
    hardware_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_agent=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = AgentConfig {
        server_addr: args.server,
        tick: Duration::from_secs(args.tick_secs),
        load_window: Duration::from_millis(args.load_window_ms),
        reconnect_delay: Duration::from_secs(args.reconnect_secs),
        ..AgentConfig::default()
    };

    let source = SystemSource::with_hardware_id(args.hardware_id);
    info!("Starting Pulse agent");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        hardware_id = source.hardware_id(),
        server = %config.server_addr,
        "Agent identity resolved"
    );

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = pulse_agent::run(config, source) => {
            if let Err(e) = result {
                error!("Agent error: {}", e);
                return Err(e.into());
            }
        }
        _ = shutdown_signal => {
            info!("Shutting down agent");
        }
    }

    Ok(())
}
