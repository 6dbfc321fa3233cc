//! STUN address prober
//!
//! One binding request per (local port, server) pair. The prober never
//! retries: a retry is the caller's decision and a new transaction.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::NetworkError;
use super::transport::{any_addr, bind_udp};
use crate::protocol::stun::{decode_reflexive_address, MappedAddress, StunTransaction};

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Default time to wait for a binding response
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest STUN response we accept
const MAX_RESPONSE_SIZE: usize = 576;

/// A public STUN server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl StunServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The built-in server list
    pub fn defaults() -> Vec<StunServer> {
        DEFAULT_STUN_SERVERS
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Resolve to the first IPv4 address of the host
    pub async fn resolve(&self) -> Result<SocketAddr, NetworkError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| NetworkError::StunFailed(format!("DNS lookup for {} failed: {}", self, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| NetworkError::StunFailed(format!("No IPv4 address for {}", self)))
    }
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for StunServer {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidStunServer(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for StunServer {
    type Error = NetworkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StunServer> for String {
    fn from(server: StunServer) -> Self {
        server.to_string()
    }
}

/// Ask `server` for the mapping of `local_port`
///
/// The socket lives only for this call and is released on every path.
pub async fn probe(
    local_port: u16,
    server: &StunServer,
    probe_timeout: Duration,
) -> Result<MappedAddress, NetworkError> {
    let server_addr = server.resolve().await?;
    let socket = bind_udp(any_addr(local_port))?;

    let transaction = StunTransaction::new();
    debug!(
        "Sending STUN binding request to {} ({}) from port {}",
        server, server_addr, local_port
    );
    socket.send_to(&transaction.encode(), server_addr).await?;

    let mut buf = [0u8; MAX_RESPONSE_SIZE];
    let (len, from) = timeout(probe_timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NetworkError::Timeout)??;
    let response = &buf[..len];

    if !transaction.matches(response) {
        return Err(NetworkError::StunFailed(format!(
            "Transaction ID mismatch in response from {}",
            from
        )));
    }

    let mapped = decode_reflexive_address(response).ok_or_else(|| {
        NetworkError::StunFailed(format!("No mapped address in response from {}", from))
    })?;

    debug!(
        "STUN {} mapped port {} to {} in {:?}",
        server,
        local_port,
        mapped,
        transaction.elapsed()
    );
    Ok(mapped)
}

/// Find our public address for `local_port`, trying servers in order
pub async fn discover_public_address(
    local_port: u16,
    servers: &[StunServer],
    probe_timeout: Duration,
) -> Result<(MappedAddress, StunServer), NetworkError> {
    for server in servers {
        match probe(local_port, server, probe_timeout).await {
            Ok(mapped) => {
                info!("STUN discovered public address {} via {}", mapped, server);
                return Ok((mapped, server.clone()));
            }
            Err(e) => {
                warn!("STUN request to {} failed: {}", server, e);
            }
        }
    }

    Err(NetworkError::StunFailed("All STUN servers failed".to_string()))
}
