//! # Pulse Domain Types
//!
//! Shared types for the telemetry cluster: the per-tick sample agents
//! produce, the persisted registration record, peer roles, and the CPU
//! load math applied to cumulative counter snapshots.

pub mod load;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

pub use load::{delta_load_percent, round2, CpuTimes};

/// One hardware/performance snapshot produced by an agent.
///
/// Immutable once produced; one per tick per agent. The first sample of
/// a connection doubles as the registration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Stable identifier for the reporting host (MAC address or host name)
    pub hardware_id: String,

    /// Operating system family, e.g. "Linux" or "OS X"
    pub os_type: String,

    /// Seconds since the host booted
    pub uptime_seconds: u64,

    /// Physical memory installed, in bytes
    pub total_memory_bytes: u64,

    /// Memory currently free, in bytes
    pub free_memory_bytes: u64,

    /// Used memory as a percentage of total, rounded to 2 decimals
    pub memory_usage_percent: f64,

    /// Number of logical CPU cores
    pub core_count: u32,

    /// CPU model string of the first core
    pub core_model: String,

    /// Advertised core frequency in MHz
    pub core_speed_mhz: u64,

    /// CPU load over the sampling window, 0.0..=100.0
    pub cpu_load_percent: f64,

    /// When the sample was taken
    pub timestamp: SystemTime,
}

/// Role a connected peer holds after authentication.
///
/// Closed enumeration: auth keys outside the two known tags never map
/// to a role, they disconnect the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Connected but not yet authenticated
    Unauthenticated,
    /// Monitoring agent streaming samples
    Agent,
    /// Dashboard-style observer receiving every agent's events
    DashboardManager,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Unauthenticated => write!(f, "unauthenticated"),
            PeerRole::Agent => write!(f, "agent"),
            PeerRole::DashboardManager => write!(f, "manager"),
        }
    }
}

/// Persisted registration record, keyed by hardware id.
///
/// Created at most once per hardware id; the store adapter enforces
/// this with an atomic conditional insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub hardware_id: String,
    pub os_type: String,
    pub core_count: u32,
    pub core_model: String,
    pub core_speed_mhz: u64,
    pub total_memory_bytes: u64,
    /// When this host first registered with the cluster
    pub registered_at: SystemTime,
}

impl RegistrationRecord {
    /// Build a record from the registration sample.
    pub fn from_sample(sample: &TelemetrySample) -> Self {
        Self {
            hardware_id: sample.hardware_id.clone(),
            os_type: sample.os_type.clone(),
            core_count: sample.core_count,
            core_model: sample.core_model.clone(),
            core_speed_mhz: sample.core_speed_mhz,
            total_memory_bytes: sample.total_memory_bytes,
            registered_at: sample.timestamp,
        }
    }
}

/// Result of a find-or-create registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationOutcome {
    /// No record existed for this hardware id; one was created
    Created,
    /// A record already existed; nothing was written
    Existing,
}

impl fmt::Display for RegistrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationOutcome::Created => write!(f, "created"),
            RegistrationOutcome::Existing => write!(f, "existing"),
        }
    }
}

/// Used-memory percentage from total/free counters, rounded to 2 decimals.
pub fn memory_usage_percent(total_bytes: u64, free_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return 0.0;
    }
    let used = total_bytes.saturating_sub(free_bytes);
    round2(used as f64 / total_bytes as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_usage_percent() {
        assert_eq!(memory_usage_percent(1000, 250), 75.0);
        assert_eq!(memory_usage_percent(0, 0), 0.0);
        // free > total reported by some virtualized hosts; clamp at 0 used
        assert_eq!(memory_usage_percent(100, 200), 0.0);
    }

    #[test]
    fn test_registration_record_from_sample() {
        let sample = TelemetrySample {
            hardware_id: "AA:BB:CC:DD:EE:FF".to_string(),
            os_type: "Linux".to_string(),
            uptime_seconds: 42,
            total_memory_bytes: 8 << 30,
            free_memory_bytes: 4 << 30,
            memory_usage_percent: 50.0,
            core_count: 4,
            core_model: "Test CPU".to_string(),
            core_speed_mhz: 2400,
            cpu_load_percent: 12.34,
            timestamp: SystemTime::now(),
        };

        let record = RegistrationRecord::from_sample(&sample);
        assert_eq!(record.hardware_id, sample.hardware_id);
        assert_eq!(record.core_count, 4);
        assert_eq!(record.registered_at, sample.timestamp);
    }
}
