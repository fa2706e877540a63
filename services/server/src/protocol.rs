//! Telemetry protocol state machine.
//!
//! One instance per connection. States:
//!
//! ```text
//! Unauthenticated -> AuthenticatedAgent -> Registered -> Streaming
//!                 \-> AuthenticatedManager
//! ```
//!
//! with `Disconnected` reachable from every state on transport close.
//! A bad auth key force-closes the connection with no error payload;
//! malformed frame payloads are logged and skipped; transport close
//! triggers local cleanup only, never a store mutation.

use crate::broadcast::BusHandle;
use crate::metrics::SessionMetrics;
use crate::store::RegistrationStore;
use crate::ServerResult;
use pulse_types::{PeerRole, RegistrationRecord, TelemetrySample};
use pulse_wire::{frame, BusEvent, ClientMessage, AGENT_AUTH_KEY, MANAGER_AUTH_KEY};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Connection-scoped peer identity.
#[derive(Debug)]
pub struct Peer {
    pub connection_id: u64,
    pub role: PeerRole,
}

/// What an auth key maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthDecision {
    Agent,
    Manager,
    Reject,
}

fn classify_auth(key: &str) -> AuthDecision {
    // Closed mapping: every key outside the two known tags rejects.
    if key == AGENT_AUTH_KEY {
        AuthDecision::Agent
    } else if key == MANAGER_AUTH_KEY {
        AuthDecision::Manager
    } else {
        AuthDecision::Reject
    }
}

/// Session state; `Disconnected` is represented by returning from the
/// session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unauthenticated,
    AuthenticatedAgent,
    Registered,
    Streaming,
    Manager,
}

/// Retry policy for store calls during registration. The store being
/// unreachable must not kill the agent's connection.
#[derive(Debug, Clone)]
pub struct StoreRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Shared dependencies for every session on one worker.
pub struct SessionContext {
    pub bus: BusHandle,
    pub store: Arc<dyn RegistrationStore>,
    pub metrics: Arc<SessionMetrics>,
    pub max_frame: usize,
    pub store_retry: StoreRetry,
}

/// Drive the protocol state machine over one connection until it
/// disconnects. Generic over the transport so tests can use inprocess
/// duplex streams.
pub async fn run_session<S>(stream: S, peer_addr: String, connection_id: u64, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    ctx.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
    ctx.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
    debug!(connection_id, peer = %peer_addr, "Session opened");

    let (mut reader, writer) = tokio::io::split(stream);
    let mut peer = Peer {
        connection_id,
        role: PeerRole::Unauthenticated,
    };
    let mut state = SessionState::Unauthenticated;
    // Writer is handed to the forwarding task once a manager
    // authenticates; agents never receive traffic.
    let mut writer = Some(writer);
    let mut forward_task: Option<tokio::task::JoinHandle<()>> = None;

    loop {
        let payload = match frame::read_frame_bytes(&mut reader, ctx.max_frame).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                debug!(connection_id, "Transport error: {}", e);
                break;
            }
        };

        let message = match frame::decode::<ClientMessage>(&payload) {
            Ok(message) => message,
            Err(e) => {
                // Recoverable: keep the connection, skip the payload.
                ctx.metrics.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id, "Malformed frame ignored: {}", e);
                continue;
            }
        };

        match (state, message) {
            (SessionState::Unauthenticated, ClientMessage::Auth { key }) => {
                match classify_auth(&key) {
                    AuthDecision::Agent => {
                        peer.role = PeerRole::Agent;
                        state = SessionState::AuthenticatedAgent;
                        info!(connection_id, "Agent authenticated");
                    }
                    AuthDecision::Manager => {
                        peer.role = PeerRole::DashboardManager;
                        state = SessionState::Manager;
                        info!(connection_id, "Manager authenticated");
                        // Managers observe every agent cluster-wide from
                        // the moment they authenticate.
                        if let Some(writer) = writer.take() {
                            let rx = ctx.bus.subscribe();
                            let max_frame = ctx.max_frame;
                            forward_task = Some(tokio::spawn(async move {
                                forward_events(writer, rx, connection_id, max_frame).await;
                            }));
                        }
                    }
                    AuthDecision::Reject => {
                        // Force close: no retry, no error payload.
                        ctx.metrics.auth_rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(connection_id, "Rejected unknown auth key");
                        break;
                    }
                }
            }

            (SessionState::Unauthenticated, _) => {
                // Unauthenticated peers get no protocol surface.
                ctx.metrics.auth_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id, "Message before auth, closing");
                break;
            }

            (
                SessionState::AuthenticatedAgent,
                ClientMessage::InitialRegistration { hardware_id, sample },
            ) => {
                state = SessionState::Registered;
                register_agent(&ctx, connection_id, &hardware_id, &sample).await;
            }

            (SessionState::Registered | SessionState::Streaming, ClientMessage::Sample { sample }) => {
                state = SessionState::Streaming;
                ctx.metrics.samples_received.fetch_add(1, Ordering::Relaxed);
                publish(&ctx, connection_id, &BusEvent::Sample { sample }).await;
            }

            (SessionState::Registered | SessionState::Streaming, ClientMessage::InitialRegistration { .. }) => {
                // find_or_create is exactly-once per connection.
                warn!(connection_id, "Duplicate initial registration ignored");
            }

            (SessionState::AuthenticatedAgent, ClientMessage::Sample { .. }) => {
                warn!(connection_id, "Sample before registration ignored");
            }

            (_, ClientMessage::Auth { .. }) => {
                debug!(connection_id, "Redundant auth ignored");
            }

            (SessionState::Manager, _) => {
                debug!(connection_id, "Ignoring message from manager peer");
            }
        }
    }

    // Transport close: local cleanup only, no store mutation.
    if let Some(task) = forward_task {
        task.abort();
    }
    ctx.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
    debug!(connection_id, role = %peer.role, "Session closed");
}

/// Registration side effects: find-or-create exactly once, then an
/// AgentOnline event for every manager cluster-wide.
async fn register_agent(
    ctx: &Arc<SessionContext>,
    connection_id: u64,
    hardware_id: &str,
    sample: &TelemetrySample,
) {
    let record = RegistrationRecord::from_sample(sample);

    match find_or_create_with_retry(ctx, hardware_id, &record).await {
        Ok(outcome) => {
            info!(connection_id, hardware_id, %outcome, "Agent registered");
            publish(
                ctx,
                connection_id,
                &BusEvent::AgentOnline {
                    hardware_id: hardware_id.to_string(),
                    sample: sample.clone(),
                    outcome,
                },
            )
            .await;
        }
        Err(e) => {
            // Surfaced, not fatal: the agent keeps streaming and the
            // record is picked up on its next connection.
            warn!(
                connection_id,
                hardware_id, "Registration store unavailable, continuing without record: {}", e
            );
        }
    }
}

async fn find_or_create_with_retry(
    ctx: &Arc<SessionContext>,
    hardware_id: &str,
    record: &RegistrationRecord,
) -> ServerResult<pulse_types::RegistrationOutcome> {
    let attempts = ctx.store_retry.attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match ctx.store.find_or_create(hardware_id, record).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                warn!(hardware_id, attempt, "Store call failed: {}", e);
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(ctx.store_retry.delay * attempt).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| crate::ServerError::Store("store retries exhausted".to_string())))
}

async fn publish(ctx: &Arc<SessionContext>, connection_id: u64, event: &BusEvent) {
    match ctx.bus.publish(event).await {
        Ok(()) => {
            ctx.metrics.events_published.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            warn!(connection_id, "Broadcast publish failed: {}", e);
        }
    }
}

/// Write every bus event to one manager peer until the write side
/// fails or the session ends.
async fn forward_events<W>(
    mut writer: W,
    mut rx: broadcast::Receiver<BusEvent>,
    connection_id: u64,
    max_frame: usize,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(e) = frame::write_frame(&mut writer, &event, max_frame).await {
                    debug!(connection_id, "Manager write failed: {}", e);
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                warn!(connection_id, dropped, "Manager peer lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_classification_is_closed() {
        assert_eq!(classify_auth("node-client"), AuthDecision::Agent);
        assert_eq!(classify_auth("client-manager"), AuthDecision::Manager);
        assert_eq!(classify_auth("bogus"), AuthDecision::Reject);
        assert_eq!(classify_auth(""), AuthDecision::Reject);
        assert_eq!(classify_auth("Node-Client"), AuthDecision::Reject);
    }
}
