//! Per-worker session server.
//!
//! Resumes connections handed off by the router and treats them like
//! locally accepted ones: a blocking thread drains the slot's handoff
//! socket and feeds reconstructed streams into the async side, which
//! runs one protocol state machine per connection against the single
//! shared bus handle and store for the process.

use crate::broadcast::BusHandle;
use crate::config::ClusterConfig;
use crate::handoff;
use crate::metrics::SessionMetrics;
use crate::protocol::{run_session, SessionContext, StoreRetry};
use crate::store::{FsRegistrationStore, RegistrationStore};
use crate::ServerResult;
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Interval between metrics log lines.
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Run one worker process: bind the slot's handoff socket, join the
/// bus and serve sessions until the process is killed.
pub async fn run_worker(config: ClusterConfig, slot: usize) -> ServerResult<()> {
    info!(slot, "Worker starting");

    let socket = handoff::bind_worker_socket(&config.worker_socket(slot))?;
    let bus = BusHandle::connect(
        &config.bus_socket(),
        config.bus_capacity,
        config.max_frame_bytes,
    )
    .await?;
    let store: Arc<dyn RegistrationStore> =
        Arc::new(FsRegistrationStore::new(config.store_dir.clone()));

    let ctx = Arc::new(SessionContext {
        bus,
        store,
        metrics: Arc::new(SessionMetrics::new()),
        max_frame: config.max_frame_bytes,
        store_retry: StoreRetry::default(),
    });

    // Blocking receive loop on a dedicated thread; the channel closes
    // if it ever dies, which ends the worker and triggers a respawn.
    let (handed_tx, handed_rx) = mpsc::unbounded_channel::<(StdTcpStream, String)>();
    std::thread::Builder::new()
        .name(format!("handoff-{}", slot))
        .spawn(move || loop {
            match handoff::recv_stream(&socket) {
                Ok(handed) => {
                    if handed_tx.send(handed).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(slot, "Handoff receive failed: {}", e);
                }
            }
        })?;

    let reporter_metrics = ctx.metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            info!(slot, "{}", reporter_metrics);
        }
    });

    info!(slot, "Worker ready");
    serve_handed_connections(handed_rx, ctx).await;

    error!(slot, "Handoff channel closed, worker exiting");
    Ok(())
}

/// Accept-equivalent loop over handed-off connections.
async fn serve_handed_connections(
    mut handed_rx: mpsc::UnboundedReceiver<(StdTcpStream, String)>,
    ctx: Arc<SessionContext>,
) {
    let connection_counter = AtomicU64::new(0);

    while let Some((std_stream, peer_addr)) = handed_rx.recv().await {
        let stream = match resume_stream(std_stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer_addr, "Could not resume handed-off stream: {}", e);
                continue;
            }
        };

        let connection_id = connection_counter.fetch_add(1, Ordering::SeqCst);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            run_session(stream, peer_addr, connection_id, ctx).await;
        });
    }
}

/// Re-arm a handed-off descriptor for the tokio reactor.
fn resume_stream(std_stream: StdTcpStream) -> std::io::Result<tokio::net::TcpStream> {
    std_stream.set_nonblocking(true)?;
    tokio::net::TcpStream::from_std(std_stream)
}
