//! Cluster configuration.
//!
//! Loaded from a TOML file or assembled from CLI flags; the router
//! process writes the effective configuration into the runtime
//! directory so respawned workers always start from the same view.

use crate::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level cluster configuration shared by router and workers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Public TCP address the router binds
    pub listen_addr: String,

    /// Worker process count; 0 means one per host CPU core, measured
    /// once at boot
    pub worker_count: usize,

    /// Directory for the handoff and bus sockets plus the effective
    /// config snapshot
    pub runtime_dir: PathBuf,

    /// Directory the filesystem registration store writes into
    pub store_dir: PathBuf,

    /// Broadcast bus channel capacity (events buffered per subscriber)
    pub bus_capacity: usize,

    /// Maximum wire frame payload size in bytes
    pub max_frame_bytes: usize,

    /// Worker respawn rate limiting
    pub restart: RestartConfig,
}

/// Bounded-rate restart limiting for the worker supervisor.
///
/// The naive respawn-immediately loop livelocks on a persistently
/// crashing worker; delays double from `initial_delay_ms` up to
/// `max_delay_ms` and reset once a worker survives
/// `healthy_after_secs`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestartConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub healthy_after_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            healthy_after_secs: 30,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7711".to_string(),
            worker_count: 0,
            runtime_dir: PathBuf::from("/tmp/pulse"),
            store_dir: PathBuf::from("/var/lib/pulse/registrations"),
            bus_capacity: 1024,
            max_frame_bytes: 64 * 1024,
            restart: RestartConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ServerError::Config(format!("Failed to read config file: {}", e)))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ServerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the effective configuration for workers to pick up.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ServerError::Config(format!("Failed to encode config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Path of the config snapshot inside the runtime directory.
    pub fn snapshot_path(&self) -> PathBuf {
        self.runtime_dir.join("cluster.toml")
    }

    /// Handoff datagram socket path for one worker slot.
    pub fn worker_socket(&self, slot: usize) -> PathBuf {
        self.runtime_dir.join(format!("worker-{}.sock", slot))
    }

    /// Broadcast bus socket path.
    pub fn bus_socket(&self) -> PathBuf {
        self.runtime_dir.join("bus.sock")
    }

    /// Worker count with the auto (0) value resolved to host cores.
    ///
    /// Measured once; the slot count never changes after boot.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> ServerResult<()> {
        if self.worker_count > 255 {
            return Err(ServerError::Config(
                "worker_count must be <= 255".to_string(),
            ));
        }
        if self.bus_capacity == 0 {
            return Err(ServerError::Config("bus_capacity must be > 0".to_string()));
        }
        if self.max_frame_bytes < 512 {
            return Err(ServerError::Config(
                "max_frame_bytes must be >= 512".to_string(),
            ));
        }
        if self.restart.initial_delay_ms == 0 {
            return Err(ServerError::Config(
                "restart.initial_delay_ms must be > 0".to_string(),
            ));
        }
        if self.restart.max_delay_ms < self.restart.initial_delay_ms {
            return Err(ServerError::Config(
                "restart.max_delay_ms must be >= restart.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ClusterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_effective_worker_count_auto() {
        let config = ClusterConfig::default();
        assert!(config.effective_worker_count() >= 1);

        let fixed = ClusterConfig {
            worker_count: 4,
            ..ClusterConfig::default()
        };
        assert_eq!(fixed.effective_worker_count(), 4);
    }

    #[test]
    fn test_rejects_bad_limits() {
        let mut config = ClusterConfig::default();
        config.bus_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.restart.max_delay_ms = 1;
        config.restart.initial_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig {
            runtime_dir: dir.path().to_path_buf(),
            worker_count: 2,
            ..ClusterConfig::default()
        };
        config.write_to(config.snapshot_path()).unwrap();

        let loaded = ClusterConfig::from_file(config.snapshot_path()).unwrap();
        assert_eq!(loaded.worker_count, 2);
        assert_eq!(loaded.listen_addr, config.listen_addr);
    }
}
