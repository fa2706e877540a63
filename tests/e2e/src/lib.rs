//! Test fixtures for end-to-end cluster scenarios.
//!
//! Builds a miniature cluster inside one process: the real broadcast
//! hub, a shared filesystem registration store, and several session
//! servers standing in for worker processes, each listening on its own
//! loopback port. Peers connect over real TCP and speak the production
//! wire protocol.

use pulse_server::protocol::{SessionContext, StoreRetry};
use pulse_server::{run_session, BroadcastHub, BusHandle, FsRegistrationStore, SessionMetrics};
use pulse_types::TelemetrySample;
use pulse_wire::frame::{read_frame, write_frame};
use pulse_wire::messages::{BusEvent, ClientMessage, AGENT_AUTH_KEY, MANAGER_AUTH_KEY};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const MAX_FRAME: usize = 64 * 1024;

/// One in-process session server standing in for a worker.
pub struct TestWorker {
    pub addr: String,
    accept_task: JoinHandle<()>,
}

/// A hub, a shared store and N workers.
pub struct TestCluster {
    pub store_dir: PathBuf,
    pub workers: Vec<TestWorker>,
    runtime: TempDir,
    hub_task: JoinHandle<()>,
}

impl TestCluster {
    /// Stand up the hub and `worker_count` session servers.
    pub async fn start(worker_count: usize) -> anyhow::Result<Self> {
        let runtime = tempfile::tempdir()?;
        let bus_path = runtime.path().join("bus.sock");
        let store_dir = runtime.path().join("registrations");
        std::fs::create_dir_all(&store_dir)?;

        let hub = BroadcastHub::new(bus_path.clone(), 256, MAX_FRAME);
        let hub_task = tokio::spawn(async move {
            let _ = hub.run().await;
        });

        let mut workers = Vec::new();
        for _ in 0..worker_count {
            let bus = BusHandle::connect(&bus_path, 256, MAX_FRAME).await?;
            let ctx = Arc::new(SessionContext {
                bus,
                store: Arc::new(FsRegistrationStore::new(store_dir.clone())),
                metrics: Arc::new(SessionMetrics::new()),
                max_frame: MAX_FRAME,
                store_retry: StoreRetry {
                    attempts: 2,
                    delay: Duration::from_millis(20),
                },
            });

            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?.to_string();
            let accept_task = tokio::spawn(async move {
                let ids = AtomicU64::new(0);
                loop {
                    let Ok((stream, peer)) = listener.accept().await else {
                        break;
                    };
                    let id = ids.fetch_add(1, Ordering::Relaxed);
                    let ctx = ctx.clone();
                    tokio::spawn(run_session(stream, peer.to_string(), id, ctx));
                }
            });
            workers.push(TestWorker { addr, accept_task });
        }

        Ok(Self {
            store_dir,
            workers,
            runtime,
            hub_task,
        })
    }

    /// Registration records currently persisted.
    pub fn stored_records(&self) -> usize {
        std::fs::read_dir(&self.store_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub fn runtime_path(&self) -> &std::path::Path {
        self.runtime.path()
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.hub_task.abort();
        for worker in &self.workers {
            worker.accept_task.abort();
        }
    }
}

/// Connect and authenticate as a manager; returns the stream carrying
/// forwarded bus events.
pub async fn connect_manager(addr: &str) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(
        &mut stream,
        &ClientMessage::Auth {
            key: MANAGER_AUTH_KEY.to_string(),
        },
        MAX_FRAME,
    )
    .await?;
    Ok(stream)
}

/// Connect and authenticate as an agent.
pub async fn connect_agent(addr: &str) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(
        &mut stream,
        &ClientMessage::Auth {
            key: AGENT_AUTH_KEY.to_string(),
        },
        MAX_FRAME,
    )
    .await?;
    Ok(stream)
}

/// A plausible sample for one host.
pub fn sample(hardware_id: &str) -> TelemetrySample {
    TelemetrySample {
        hardware_id: hardware_id.to_string(),
        os_type: "Linux".to_string(),
        uptime_seconds: 7200,
        total_memory_bytes: 16 << 30,
        free_memory_bytes: 6 << 30,
        memory_usage_percent: 62.5,
        core_count: 8,
        core_model: "Fixture CPU".to_string(),
        core_speed_mhz: 3200,
        cpu_load_percent: 11.5,
        timestamp: SystemTime::now(),
    }
}

/// Read bus events off a manager stream until one matches, within a
/// timeout.
pub async fn expect_event<F>(
    stream: &mut TcpStream,
    timeout: Duration,
    mut matches: F,
) -> anyhow::Result<BusEvent>
where
    F: FnMut(&BusEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event: Option<BusEvent> =
            tokio::time::timeout_at(deadline, read_frame(stream, MAX_FRAME)).await??;
        match event {
            Some(event) if matches(&event) => return Ok(event),
            Some(_) => continue,
            None => anyhow::bail!("manager stream closed before the expected event"),
        }
    }
}
