//! Front-end connection router.
//!
//! Owns the single public TCP port. Every accepted connection is
//! assigned to a worker slot by a deterministic hash of its source IP
//! and handed off without reading a single byte from the stream. The
//! router holds no knowledge of the session protocol.

use crate::{config::ClusterConfig, handoff, ServerResult};
use std::net::IpAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Worker slot for a source address.
///
/// `crc32(ip_text) % n` over the textual form of the address, which is
/// defined for both IPv4 and IPv6. CRC32 is fast, evenly distributed
/// and, unlike the std hasher, stable across process restarts, so a
/// reconnecting peer always lands on the same slot for the lifetime of
/// one boot (fixed n).
pub fn route_slot(ip: Option<IpAddr>, n: usize) -> usize {
    debug_assert!(n > 0);
    match ip {
        Some(ip) => crc32fast::hash(ip.to_string().as_bytes()) as usize % n,
        // No usable source address: route to the fixed default slot
        // instead of dropping the connection.
        None => 0,
    }
}

/// Single-process front-end accepting and dispatching raw connections.
pub struct ConnectionRouter {
    config: ClusterConfig,
    worker_count: usize,
}

impl ConnectionRouter {
    pub fn new(config: ClusterConfig, worker_count: usize) -> Self {
        Self {
            config,
            worker_count,
        }
    }

    /// Accept loop. Runs until the listener fails fatally.
    pub async fn run(&self) -> ServerResult<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!(
            addr = %self.config.listen_addr,
            workers = self.worker_count,
            "Connection router listening"
        );

        loop {
            match listener.accept().await {
                Ok((stream, _)) => self.dispatch(stream),
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Hand one accepted connection to its slot's worker.
    ///
    /// Ownership of the stream transfers with the sendmsg; on any
    /// failure (typically a worker mid-respawn with its socket not yet
    /// bound) the connection is dropped and the peer re-routes to the
    /// same slot when it reconnects.
    fn dispatch(&self, stream: tokio::net::TcpStream) {
        let ip = stream.peer_addr().ok().map(|a| a.ip());
        let peer_text = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        if ip.is_none() {
            warn!("Connection without a usable source address, routing to slot 0");
        }
        let slot = route_slot(ip, self.worker_count);
        let target = self.config.worker_socket(slot);

        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => {
                warn!(slot, "Failed to detach accepted stream: {}", e);
                return;
            }
        };

        // sendmsg on a datagram socket can block if the worker's queue
        // is full; keep it off the accept loop.
        tokio::task::spawn_blocking(move || {
            match handoff::send_stream(&target, std_stream, &peer_text) {
                Ok(()) => {
                    tracing::debug!(slot, peer = %peer_text, "Connection handed off");
                }
                Err(e) => {
                    warn!(slot, peer = %peer_text, "Dropping connection, handoff failed: {}", e);
                }
            }
        });
    }
}
