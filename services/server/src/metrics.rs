//! Per-worker session metrics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one worker's session server, reported periodically.
pub struct SessionMetrics {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub samples_received: AtomicU64,
    pub events_published: AtomicU64,
    pub auth_rejected: AtomicU64,
    pub malformed_frames: AtomicU64,
    started_at: Instant,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            samples_received: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            auth_rejected: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl fmt::Display for SessionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionMetrics {{ connections: {}/{}, samples: {}, published: {}, rejected_auth: {}, malformed: {}, uptime: {}s }}",
            self.connections_active.load(Ordering::Relaxed),
            self.connections_total.load(Ordering::Relaxed),
            self.samples_received.load(Ordering::Relaxed),
            self.events_published.load(Ordering::Relaxed),
            self.auth_rejected.load(Ordering::Relaxed),
            self.malformed_frames.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}
