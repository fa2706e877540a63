//! # Pulse Wire Protocol
//!
//! Message-oriented framing shared by the session server, agents and
//! managers: a 4-byte little-endian length prefix followed by a
//! bincode payload, plus the closed set of protocol messages.

pub mod frame;
pub mod messages;

pub use frame::{decode, read_frame, read_frame_bytes, write_frame, write_frame_bytes};
pub use messages::{BusEvent, ClientMessage, AGENT_AUTH_KEY, HANDOFF_TAG, MANAGER_AUTH_KEY};

/// Wire-level errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[source] bincode::Error),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Result type for wire operations.
pub type WireResult<T> = std::result::Result<T, WireError>;
