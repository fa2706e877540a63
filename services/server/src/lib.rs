//! # Pulse Telemetry Cluster Server
//!
//! Connection-routing and session-protocol layer for the telemetry
//! cluster. One front-end router process owns the public TCP port and
//! hands every accepted connection to one of N worker processes by a
//! deterministic source-address hash; a supervisor keeps exactly N
//! workers alive; each worker runs the session protocol state machine
//! over its connections and publishes registration and sample events
//! on a cross-worker broadcast bus so manager peers see every agent
//! regardless of placement.

pub mod broadcast;
pub mod config;
pub mod handoff;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;
pub mod supervisor;

pub use broadcast::{BroadcastHub, BusHandle};
pub use config::ClusterConfig;
pub use metrics::SessionMetrics;
pub use protocol::{run_session, SessionContext};
pub use router::{route_slot, ConnectionRouter};
pub use store::{FsRegistrationStore, MemoryRegistrationStore, RegistrationStore};
pub use supervisor::{RestartBudget, Supervisor};

/// Server-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] pulse_wire::WireError),

    #[error("Handoff error: {0}")]
    Handoff(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Broadcast bus error: {0}")]
    Bus(String),
}

impl From<nix::errno::Errno> for ServerError {
    fn from(errno: nix::errno::Errno) -> Self {
        ServerError::Handoff(errno.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;
