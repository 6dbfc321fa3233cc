//! Minimal STUN binding responder
//!
//! Answers every binding request with the address it came from, or with a
//! fixed mapping when one is configured. Used by the `stun-server` binary
//! and as a stand-in for public servers in tests.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::error::{is_transient_io, NetworkError};
use super::state::CancelFlag;
use super::transport::bind_udp;
use crate::protocol::stun::{encode_binding_response, MappedAddress, BINDING_REQUEST, HEADER_SIZE};

/// How often the receive loop checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A bound STUN responder
pub struct StunResponder {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    fixed_mapping: Option<MappedAddress>,
}

impl StunResponder {
    pub fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let socket = bind_udp(addr)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            fixed_mapping: None,
        })
    }

    /// Report `mapping` to every client instead of its real source address
    pub fn with_fixed_mapping(mut self, mapping: MappedAddress) -> Self {
        self.fixed_mapping = Some(mapping);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Mapping reported for a request from `from`
    fn mapping_for(&self, from: SocketAddr) -> Option<MappedAddress> {
        if let Some(fixed) = self.fixed_mapping {
            return Some(fixed);
        }
        match from {
            SocketAddr::V4(v4) => Some(MappedAddress::from(v4)),
            SocketAddr::V6(v6) => v6
                .ip()
                .to_ipv4_mapped()
                .map(|ip| MappedAddress::from(SocketAddrV4::new(ip, v6.port()))),
        }
    }

    /// Answer one datagram; returns whether a response was sent
    async fn handle(&self, request: &[u8], from: SocketAddr) -> bool {
        if request.len() < HEADER_SIZE
            || u16::from_be_bytes([request[0], request[1]]) != BINDING_REQUEST
        {
            debug!("Ignoring non-binding datagram from {}", from);
            return false;
        }
        let Some(mapping) = self.mapping_for(from) else {
            debug!("Cannot express {} as IPv4 mapping", from);
            return false;
        };

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&request[8..HEADER_SIZE]);
        let response = encode_binding_response(&transaction_id, mapping);

        match self.socket.send_to(&response, from).await {
            Ok(_) => {
                trace!("Answered {} with {}", from, mapping);
                true
            }
            Err(e) => {
                warn!("Failed to answer {}: {}", from, e);
                false
            }
        }
    }

    /// Serve until `cancel` is raised; returns the number of answered requests
    pub async fn run(&self, cancel: CancelFlag) -> u64 {
        let mut buf = [0u8; 1024];
        let mut answered = 0u64;

        while !cancel.is_cancelled() {
            match timeout(POLL_INTERVAL, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok((len, from))) => {
                    if self.handle(&buf[..len], from).await {
                        answered += 1;
                    }
                }
                Ok(Err(e)) if is_transient_io(&e) => {
                    debug!("Transient receive error: {}", e);
                }
                Ok(Err(e)) => {
                    warn!("STUN responder stopped: {}", e);
                    break;
                }
            }
        }

        answered
    }

    /// Serve in a background task
    pub fn spawn(self, cancel: CancelFlag) -> JoinHandle<u64> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
