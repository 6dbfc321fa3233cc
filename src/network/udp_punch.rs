//! UDP hole punching
//!
//! A listener and a puncher share one bound socket. The puncher keeps
//! sending `HOLE_PUNCH` to the peer (and, when aggressive, to the ports
//! around it) so our NAT opens a mapping the peer's traffic can come back
//! through. The listener hides markers and forwards everything else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use super::error::is_transient_io;
use super::session::PunchConfig;
use super::state::{sleep_unless_cancelled, CancelFlag, SessionEvent, SessionShared};
use crate::protocol::marker::{is_hole_punch, HOLE_PUNCH};

/// Receive buffer size; larger datagrams are truncated
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Lowest port the aggressive spray will target
const MIN_SPRAY_PORT: u16 = 1024;

/// Addresses to punch each round, the declared peer address first
pub fn punch_targets(peer: SocketAddr, config: &PunchConfig) -> Vec<SocketAddr> {
    let mut targets = vec![peer];
    if !config.aggressive {
        return targets;
    }

    let low = peer.port().saturating_sub(config.port_spread).max(MIN_SPRAY_PORT);
    let high = peer.port().saturating_add(config.port_spread);
    targets.extend(
        (low..=high)
            .filter(|&port| port != peer.port())
            .map(|port| SocketAddr::new(peer.ip(), port)),
    );
    targets
}

/// Handle one inbound datagram
async fn handle_datagram(shared: &SessionShared, payload: &[u8], from: SocketAddr, poll: Duration) {
    if is_hole_punch(payload) {
        trace!("Punch packet from {}", from);
        return;
    }

    if shared.mark_connected() {
        info!("First message from {}, path is open", from);
    }
    shared
        .deliver(
            SessionEvent::Message {
                from,
                payload: payload.to_vec(),
            },
            poll,
        )
        .await;
}

/// Read datagrams until the session is cancelled
pub(crate) fn spawn_listener(
    socket: Arc<UdpSocket>,
    shared: Arc<SessionShared>,
    config: PunchConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let poll = config.poll_interval();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while !shared.cancel.is_cancelled() {
            match timeout(poll, socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok((len, from))) => handle_datagram(&shared, &buf[..len], from, poll).await,
                // ICMP unreachable from a closed peer port surfaces here on some platforms
                Ok(Err(e)) if is_transient_io(&e) => {
                    debug!("Transient receive error: {}", e);
                }
                Ok(Err(e)) => {
                    error!("UDP listener stopped: {}", e);
                    shared.emit(SessionEvent::TaskFailed {
                        task: "udp listener",
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        debug!("UDP listener finished");
    })
}

/// Send punch packets until `stop` or the session flag is raised
pub(crate) fn spawn_puncher(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    shared: Arc<SessionShared>,
    config: PunchConfig,
    stop: CancelFlag,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let targets = punch_targets(peer, &config);
        let interval = config.punch_interval();
        info!(
            "Starting hole punching to {} ({} targets every {:?})",
            peer,
            targets.len(),
            interval
        );

        let mut rounds = 0u64;
        loop {
            if shared.cancel.is_cancelled() || stop.is_cancelled() {
                break;
            }

            for target in &targets {
                if let Err(e) = socket.send_to(HOLE_PUNCH, target).await {
                    if *target == peer {
                        debug!("Punch to {} failed: {}", target, e);
                    } else {
                        trace!("Punch to {} failed: {}", target, e);
                    }
                }
            }
            rounds += 1;

            if sleep_unless_cancelled(&[&shared.cancel, &stop], interval, config.poll_interval()).await {
                break;
            }
        }

        info!("Hole punching stopped after {} rounds", rounds);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "198.51.100.7:40000".parse().unwrap()
    }

    #[test]
    fn test_simple_targets_only_peer() {
        let config = PunchConfig::default();
        assert_eq!(punch_targets(peer(), &config), vec![peer()]);
    }

    #[test]
    fn test_aggressive_targets_cover_spread() {
        let config = PunchConfig {
            aggressive: true,
            ..PunchConfig::default()
        };
        let targets = punch_targets(peer(), &config);

        assert_eq!(targets[0], peer());
        assert_eq!(targets.len(), 21);
        assert!(targets.contains(&"198.51.100.7:39990".parse().unwrap()));
        assert!(targets.contains(&"198.51.100.7:40010".parse().unwrap()));
        assert_eq!(targets.iter().filter(|t| **t == peer()).count(), 1);
    }

    #[test]
    fn test_aggressive_targets_clamped_low() {
        let config = PunchConfig {
            aggressive: true,
            port_spread: 10,
            ..PunchConfig::default()
        };
        let targets = punch_targets("10.0.0.1:1030".parse().unwrap(), &config);
        assert!(targets.iter().all(|t| t.port() >= MIN_SPRAY_PORT));
        // 1024..=1040 minus the peer port, plus the peer itself
        assert_eq!(targets.len(), 17);
    }
}
