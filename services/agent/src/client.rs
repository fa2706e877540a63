//! Cluster client: connect, authenticate, register, stream.
//!
//! The sampling timer is created inside `stream_samples` and dropped
//! with it, so each connection owns exactly one timer. The reconnect
//! loop in `run` never holds a timer of its own; a flappy network
//! therefore cannot stack intervals and inflate the sample rate.

use crate::sampler::{collect_sample, TelemetrySource};
use crate::AgentResult;
use pulse_wire::frame::{read_frame_bytes, write_frame};
use pulse_wire::messages::{ClientMessage, AGENT_AUTH_KEY};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Agent connection settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Cluster router address
    pub server_addr: String,

    /// Interval between samples
    pub tick: Duration,

    /// Window between the two CPU counter snapshots of one sample
    pub load_window: Duration,

    /// Delay before a reconnect attempt
    pub reconnect_delay: Duration,

    /// Maximum wire frame payload size in bytes
    pub max_frame_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7711".to_string(),
            tick: Duration::from_secs(1),
            load_window: Duration::from_millis(180),
            reconnect_delay: Duration::from_secs(2),
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Connect-and-stream loop. Reconnects forever with a fixed delay; the
/// cluster's sticky routing lands every reconnect on the same worker.
pub async fn run<S: TelemetrySource>(config: AgentConfig, mut source: S) -> AgentResult<()> {
    loop {
        match TcpStream::connect(&config.server_addr).await {
            Ok(stream) => {
                info!(addr = %config.server_addr, "Connected to cluster");
                match stream_samples(stream, &mut source, &config).await {
                    Ok(()) => info!("Server closed the connection"),
                    Err(e) => warn!("Connection failed: {}", e),
                }
            }
            Err(e) => {
                warn!(addr = %config.server_addr, "Connect failed: {}", e);
            }
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

/// Drive one connection: auth, initial registration, then one sample
/// per tick until the transport closes.
///
/// Returns `Ok(())` on a clean server-side close. The interval timer
/// is local to this call; dropping the future cancels it.
pub async fn stream_samples<S, T>(
    stream: S,
    source: &mut T,
    config: &AgentConfig,
) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: TelemetrySource,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let max_frame = config.max_frame_bytes;

    write_frame(
        &mut writer,
        &ClientMessage::Auth {
            key: AGENT_AUTH_KEY.to_string(),
        },
        max_frame,
    )
    .await?;

    // Registration rides the first sample; the server treats it as
    // find-or-create, so re-sending on every reconnect is safe.
    let sample = collect_sample(source, config.load_window).await?;
    let hardware_id = sample.hardware_id.clone();
    write_frame(
        &mut writer,
        &ClientMessage::InitialRegistration {
            hardware_id,
            sample,
        },
        max_frame,
    )
    .await?;

    let mut ticker = tokio::time::interval(config.tick);
    // The first tick fires immediately; registration already carried a
    // sample, so skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sample = collect_sample(source, config.load_window).await?;
                debug!(load = sample.cpu_load_percent, "Sending sample");
                write_frame(&mut writer, &ClientMessage::Sample { sample }, max_frame).await?;
            }
            inbound = read_frame_bytes(&mut reader, max_frame) => {
                match inbound? {
                    // The server pushes nothing to agents today.
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
        }
    }
}
