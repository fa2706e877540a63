//! Protocol message definitions.
//!
//! Peer-to-server traffic is `ClientMessage`; the server pushes
//! `BusEvent`s to manager peers. The server never acknowledges:
//! successful auth and registration are implicit in the connection
//! staying open, failed auth is visible only as a transport close.

use pulse_types::{RegistrationOutcome, TelemetrySample};
use serde::{Deserialize, Serialize};

/// Auth tag presented by monitoring agents.
pub const AGENT_AUTH_KEY: &str = "node-client";

/// Auth tag presented by dashboard managers.
pub const MANAGER_AUTH_KEY: &str = "client-manager";

/// Fixed literal tagging a router-to-worker connection handoff.
pub const HANDOFF_TAG: &[u8] = b"sticky-session:connection";

/// Messages a peer sends to the session server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Role authentication with a shared tag; anything but the two
    /// known tags disconnects the peer.
    Auth { key: String },

    /// First-time registration payload, sent once per connection
    /// immediately after agent auth.
    InitialRegistration {
        hardware_id: String,
        sample: TelemetrySample,
    },

    /// Periodic sample, one per tick.
    Sample { sample: TelemetrySample },
}

/// Events published on the cross-worker broadcast bus and forwarded
/// verbatim to every connected manager peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEvent {
    /// An agent completed registration on some worker.
    AgentOnline {
        hardware_id: String,
        sample: TelemetrySample,
        outcome: RegistrationOutcome,
    },

    /// An agent streamed a sample on some worker.
    Sample { sample: TelemetrySample },
}

impl BusEvent {
    /// Hardware id the event concerns.
    pub fn hardware_id(&self) -> &str {
        match self {
            BusEvent::AgentOnline { hardware_id, .. } => hardware_id,
            BusEvent::Sample { sample } => &sample.hardware_id,
        }
    }
}
