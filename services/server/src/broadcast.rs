//! Cross-worker broadcast bus.
//!
//! Workers have no shared memory; every event raised in one worker
//! reaches the others through a hub task in the router process. Each
//! worker holds one bus connection: frames published by any worker are
//! rebroadcast to every connected worker (the publisher included, so
//! local managers see local agents through the same path).
//!
//! Delivery is best-effort with per-topic ordering only as far as the
//! underlying channel preserves it; a subscriber that falls behind the
//! channel capacity drops its oldest events with a warning.

use crate::{ServerError, ServerResult};
use pulse_wire::{frame, BusEvent};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Publish/subscribe hub running in the router process.
pub struct BroadcastHub {
    socket_path: PathBuf,
    capacity: usize,
    max_frame: usize,
}

impl BroadcastHub {
    pub fn new(socket_path: PathBuf, capacity: usize, max_frame: usize) -> Self {
        Self {
            socket_path,
            capacity,
            max_frame,
        }
    }

    /// Bind the bus socket and serve worker connections until failure.
    pub async fn run(&self) -> ServerResult<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "Broadcast hub listening");

        let (tx, _) = broadcast::channel::<Vec<u8>>(self.capacity);
        let connection_counter = AtomicU64::new(0);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let id = connection_counter.fetch_add(1, Ordering::SeqCst);
                    debug!(connection = id, "Bus subscriber connected");
                    let tx = tx.clone();
                    let max_frame = self.max_frame;
                    tokio::spawn(async move {
                        relay_connection(stream, id, tx, max_frame).await;
                    });
                }
                Err(e) => {
                    warn!("Bus accept failed: {}", e);
                }
            }
        }
    }
}

/// Serve one worker's bus connection: frames read from the worker are
/// rebroadcast; broadcast frames are written back to the worker. The
/// connection ends when either direction fails.
async fn relay_connection(
    stream: UnixStream,
    id: u64,
    tx: broadcast::Sender<Vec<u8>>,
    max_frame: usize,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut rx = tx.subscribe();

    let mut read_task = tokio::spawn(async move {
        loop {
            match frame::read_frame_bytes(&mut read_half, max_frame).await {
                Ok(Some(payload)) => {
                    // Zero receivers just means no worker is connected
                    // yet; nothing to do.
                    let _ = tx.send(payload);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(connection = id, "Bus read error: {}", e);
                    break;
                }
            }
        }
    });

    let mut write_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    if let Err(e) = frame::write_frame_bytes(&mut write_half, &payload, max_frame).await
                    {
                        warn!(connection = id, "Bus write error: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(connection = id, dropped, "Bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }
    debug!(connection = id, "Bus subscriber disconnected");
}

/// Worker-side handle on the broadcast bus.
///
/// Cloneable; all clones share the single bus connection for the
/// process. `publish` writes a frame to the hub, `subscribe` yields a
/// receiver fed by the connection's reader task.
#[derive(Clone)]
pub struct BusHandle {
    writer: Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
    local_tx: broadcast::Sender<BusEvent>,
    max_frame: usize,
}

impl BusHandle {
    /// Connect to the hub socket, retrying briefly while the hub
    /// finishes binding (a respawned worker can win that race).
    pub async fn connect(path: &Path, capacity: usize, max_frame: usize) -> ServerResult<Self> {
        let mut attempts = 0u32;
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) if attempts < 20 => {
                    attempts += 1;
                    debug!("Bus not ready ({}), retrying", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(ServerError::Bus(format!(
                        "could not reach the broadcast hub at {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        };

        let (mut read_half, write_half) = stream.into_split();
        let (local_tx, _) = broadcast::channel(capacity);

        let fanout = local_tx.clone();
        tokio::spawn(async move {
            loop {
                match frame::read_frame_bytes(&mut read_half, max_frame).await {
                    Ok(Some(payload)) => match frame::decode::<BusEvent>(&payload) {
                        Ok(event) => {
                            let _ = fanout.send(event);
                        }
                        Err(e) => {
                            warn!("Undecodable bus event ignored: {}", e);
                        }
                    },
                    Ok(None) => {
                        warn!("Broadcast hub closed the bus connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Bus connection failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(write_half)),
            local_tx,
            max_frame,
        })
    }

    /// Publish one event cluster-wide.
    pub async fn publish(&self, event: &BusEvent) -> ServerResult<()> {
        let mut writer = self.writer.lock().await;
        frame::write_frame(&mut *writer, event, self.max_frame).await?;
        Ok(())
    }

    /// Subscribe to every event on the bus, cluster-wide.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.local_tx.subscribe()
    }
}
