//! Worker process supervisor.
//!
//! Spawns exactly N workers at boot and respawns any that exit into
//! the same slot index, so the router's slot-to-worker mapping never
//! changes after boot. There is no drain phase: connections owned by a
//! dead worker are gone, and their peers re-route to the same slot
//! when they reconnect.
//!
//! Respawns are rate-limited with exponential backoff so a
//! persistently crashing worker cannot livelock the supervisor; the
//! delay resets once a worker survives a healthy-uptime window.

use crate::config::{ClusterConfig, RestartConfig};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

/// Backoff state for one worker slot.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    initial: Duration,
    max: Duration,
    healthy_after: Duration,
    current: Duration,
}

impl RestartBudget {
    pub fn new(config: &RestartConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_delay_ms),
            healthy_after: Duration::from_secs(config.healthy_after_secs),
            current: initial,
        }
    }

    /// Delay to apply before the next respawn, given how long the
    /// exited worker survived.
    pub fn on_exit(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.healthy_after {
            self.current = self.initial;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Builds the command for one worker slot. Parameterized so tests can
/// supervise stand-in processes.
pub type WorkerCommand = Arc<dyn Fn(usize) -> Command + Send + Sync>;

/// Command for a real worker: re-execute the current binary in worker
/// mode with the slot index and the config snapshot.
pub fn default_worker_command(config: &ClusterConfig) -> crate::ServerResult<WorkerCommand> {
    let exe = std::env::current_exe()?;
    let snapshot = config.snapshot_path();
    Ok(Arc::new(move |slot| {
        let mut cmd = Command::new(&exe);
        cmd.arg("worker")
            .arg("--slot")
            .arg(slot.to_string())
            .arg("--config")
            .arg(&snapshot);
        cmd
    }))
}

/// Keeps exactly N workers alive, one per slot.
pub struct Supervisor {
    restart: RestartConfig,
    command: WorkerCommand,
    restart_counts: Arc<DashMap<usize, u64>>,
}

impl Supervisor {
    pub fn new(restart: RestartConfig, command: WorkerCommand) -> Self {
        Self {
            restart,
            command,
            restart_counts: Arc::new(DashMap::new()),
        }
    }

    /// Times a slot's worker has been respawned.
    pub fn restart_count(&self, slot: usize) -> u64 {
        self.restart_counts.get(&slot).map(|c| *c).unwrap_or(0)
    }

    /// Spawn workers for slots `0..count` and keep each alive. Returns
    /// once the per-slot tasks are running.
    pub fn start(&self, count: usize) {
        for slot in 0..count {
            let command = self.command.clone();
            let mut budget = RestartBudget::new(&self.restart);
            let counts = self.restart_counts.clone();

            tokio::spawn(async move {
                loop {
                    let mut cmd = command(slot);
                    let started = Instant::now();
                    let mut child = match cmd.spawn() {
                        Ok(child) => child,
                        Err(e) => {
                            warn!(slot, "Failed to spawn worker: {}", e);
                            tokio::time::sleep(budget.on_exit(Duration::ZERO)).await;
                            continue;
                        }
                    };
                    info!(slot, pid = child.id(), "Worker spawned");

                    let status = child.wait().await;
                    let uptime = started.elapsed();
                    match status {
                        Ok(status) => {
                            warn!(slot, %status, uptime_ms = uptime.as_millis() as u64, "Worker exited")
                        }
                        Err(e) => warn!(slot, "Worker wait failed: {}", e),
                    }

                    *counts.entry(slot).or_insert(0) += 1;
                    let delay = budget.on_exit(uptime);
                    info!(slot, delay_ms = delay.as_millis() as u64, "Respawning worker");
                    tokio::time::sleep(delay).await;
                }
            });
        }
    }
}
