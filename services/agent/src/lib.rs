//! # Pulse Monitoring Agent
//!
//! Runs on every monitored host. Connects to the cluster's public
//! port, authenticates as an agent, registers the host once, then
//! streams one telemetry sample per tick until the connection drops.
//! On disconnect the sampling timer dies with the connection and a
//! fresh one starts on reconnect, so the effective tick rate never
//! compounds across reconnects.

pub mod client;
pub mod sampler;

pub use client::{run, stream_samples, AgentConfig};
pub use sampler::{collect_sample, HostInfo, SystemSource, TelemetrySource};

/// Agent-side errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] pulse_wire::WireError),

    #[error("Sampler error: {0}")]
    Sampler(String),
}

/// Result type for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
