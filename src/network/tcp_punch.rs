//! TCP simultaneous open
//!
//! A listener and a connector race on the same local port. Whichever gets a
//! stream first wins the session; the other one notices the state change
//! and stops. A second stream from a double connect is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::error::{is_transient_io, NetworkError};
use super::session::PunchConfig;
use super::state::{sleep_unless_cancelled, PunchState, SessionEvent, SessionShared};
use super::transport::{any_addr, bind_tcp_connector, bind_tcp_listener};
use crate::protocol::marker::{GreetingFilter, TCP_PUNCH};

/// Read buffer for the established stream
const READ_BUFFER_SIZE: usize = 4096;

/// Write half of the winning stream, once there is one
pub(crate) type WriterSlot = Arc<Mutex<Option<OwnedWriteHalf>>>;

fn racing(shared: &SessionShared) -> bool {
    !shared.cancel.is_cancelled() && shared.state() == PunchState::Racing
}

fn report_failure(shared: &SessionShared, task: &'static str, error: &NetworkError) {
    error!("TCP {} stopped: {}", task, error);
    shared.emit(SessionEvent::TaskFailed {
        task,
        reason: error.to_string(),
    });
}

/// Accept inbound connections until the race is decided
///
/// Uses `prebound` when the session already holds the listener, otherwise
/// binds `local_port` inside the task.
pub(crate) fn spawn_listener(
    local_port: u16,
    prebound: Option<TcpListener>,
    shared: Arc<SessionShared>,
    writer: WriterSlot,
    config: PunchConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match prebound.map_or_else(|| bind_tcp_listener(any_addr(local_port)), Ok) {
            Ok(listener) => listener,
            Err(e) => {
                report_failure(&shared, "listener", &e);
                return;
            }
        };
        info!("TCP listener waiting on port {}", local_port);

        while racing(&shared) {
            match timeout(config.poll_interval(), listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, from))) => {
                    // The listener socket is not needed past this point
                    drop(listener);
                    establish(stream, from, "inbound", &shared, &writer, &config).await;
                    return;
                }
                Ok(Err(e)) if is_transient_io(&e) => {
                    debug!("Transient accept error: {}", e);
                }
                Ok(Err(e)) => {
                    report_failure(&shared, "listener", &NetworkError::Io(e));
                    return;
                }
            }
        }

        debug!("TCP listener finished");
    })
}

/// Keep connecting to the peer from the shared local port
pub(crate) fn spawn_connector(
    local_port: u16,
    peer: SocketAddr,
    shared: Arc<SessionShared>,
    writer: WriterSlot,
    config: PunchConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Connecting to {} from port {}", peer, local_port);
        let mut attempts = 0u64;

        while racing(&shared) {
            let socket = match bind_tcp_connector(any_addr(local_port)) {
                Ok(socket) => socket,
                Err(e) => {
                    report_failure(&shared, "connector", &e);
                    return;
                }
            };

            attempts += 1;
            match timeout(config.connect_timeout(), socket.connect(peer)).await {
                Ok(Ok(stream)) => {
                    debug!("Connect attempt {} to {} succeeded", attempts, peer);
                    establish(stream, peer, "outbound", &shared, &writer, &config).await;
                    return;
                }
                Ok(Err(e)) => debug!("Connect attempt {} to {} failed: {}", attempts, peer, e),
                Err(_) => debug!("Connect attempt {} to {} timed out", attempts, peer),
            }

            if sleep_unless_cancelled(&[&shared.cancel], config.retry_delay(), config.poll_interval()).await {
                break;
            }
        }

        debug!("TCP connector finished after {} attempts", attempts);
    })
}

/// Claim the session with `stream`, then serve it until it closes
async fn establish(
    stream: TcpStream,
    peer: SocketAddr,
    direction: &'static str,
    shared: &SessionShared,
    writer: &WriterSlot,
    config: &PunchConfig,
) {
    if !shared.mark_connected() {
        debug!(
            "Dropping second {} stream with {}, first completion wins",
            direction, peer
        );
        return;
    }
    info!("TCP {} connection established with {}", direction, peer);

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let (read_half, mut write_half) = stream.into_split();
    if let Err(e) = write_half.write_all(TCP_PUNCH).await {
        debug!("Failed to send punch marker to {}: {}", peer, e);
    }

    *writer.lock().await = Some(write_half);
    shared.set_state(PunchState::Connected);

    read_stream(read_half, peer, shared, config).await;
}

/// Forward stream data, minus the peer's greeting, as session messages
async fn read_stream(
    mut read_half: OwnedReadHalf,
    peer: SocketAddr,
    shared: &SessionShared,
    config: &PunchConfig,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut greeting = GreetingFilter::new();

    while !shared.cancel.is_cancelled() {
        match timeout(config.poll_interval(), read_half.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                info!("Peer {} closed the connection", peer);
                break;
            }
            Ok(Ok(len)) => {
                let payload = greeting.feed(&buf[..len]);
                if !payload.is_empty() {
                    shared
                        .deliver(
                            SessionEvent::Message {
                                from: peer,
                                payload,
                            },
                            config.poll_interval(),
                        )
                        .await;
                }
            }
            Ok(Err(e)) => {
                warn!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    if !shared.cancel.is_cancelled() {
        shared.mark_disconnected();
        shared.set_state(PunchState::Closed);
    }
}
