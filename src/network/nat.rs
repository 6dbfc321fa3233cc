//! NAT behavior classification
//!
//! Probes a few STUN servers from consecutive local ports and compares the
//! mappings that come back. This is a heuristic in the spirit of RFC 3489
//! discovery, not a formal test: ambiguous patterns fall through to the
//! harder categories rather than claiming full cone.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use super::prober::{probe, StunServer, DEFAULT_PROBE_TIMEOUT};
use crate::protocol::stun::MappedAddress;

/// Number of (server, port) pairs probed per classification
pub const MAX_PROBES: usize = 3;

/// Range the random base port is drawn from
const BASE_PORT_RANGE: std::ops::Range<u16> = 20000..60000;

/// NAT type classification, most to least permissive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// External port tracks the local port regardless of destination
    FullCone,
    /// Same external IP, mapping reused across destinations
    AddressRestricted,
    /// Same external IP, ports advance faster than local ports
    PortRestricted,
    /// Different mapping per destination; punching is unlikely to work
    Symmetric,
    /// Not enough successful probes
    Unknown,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullCone => write!(f, "Full Cone NAT"),
            Self::AddressRestricted => write!(f, "Address Restricted NAT"),
            Self::PortRestricted => write!(f, "Port Restricted NAT"),
            Self::Symmetric => write!(f, "Symmetric NAT"),
            Self::Unknown => write!(f, "Unknown NAT Type"),
        }
    }
}

/// Outcome of one probe made during classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub server: StunServer,
    pub local_port: u16,
    pub mapped: Option<MappedAddress>,
}

/// Classified NAT type and the observation it rests on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatClassification {
    pub nat_type: NatType,
    pub evidence: String,
}

impl NatClassification {
    fn new(nat_type: NatType, evidence: impl Into<String>) -> Self {
        Self {
            nat_type,
            evidence: evidence.into(),
        }
    }

    pub fn is_symmetric(&self) -> bool {
        self.nat_type == NatType::Symmetric
    }
}

impl fmt::Display for NatClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.nat_type, self.evidence)
    }
}

/// Derive a NAT type from probe results
pub fn classify_probe_results(results: &[ProbeResult]) -> NatClassification {
    let successful: Vec<(u16, MappedAddress)> = results
        .iter()
        .filter_map(|r| r.mapped.map(|m| (r.local_port, m)))
        .collect();

    if successful.len() < 2 {
        return NatClassification::new(
            NatType::Unknown,
            format!(
                "only {} of {} probes succeeded",
                successful.len(),
                results.len()
            ),
        );
    }

    let first_ip: Ipv4Addr = successful[0].1.ip;
    if successful.iter().any(|(_, m)| m.ip != first_ip) {
        return NatClassification::new(NatType::Symmetric, "different external IPs");
    }

    let deltas: Vec<i32> = successful
        .windows(2)
        .map(|pair| {
            let (prev_local, prev_mapped) = pair[0];
            let (local, mapped) = pair[1];
            let mapped_step = i32::from(mapped.port) - i32::from(prev_mapped.port);
            let local_step = i32::from(local) - i32::from(prev_local);
            mapped_step - local_step
        })
        .collect();
    debug!("NAT port deltas: {:?}", deltas);

    if deltas.iter().all(|&d| d == 0) {
        return NatClassification::new(
            NatType::FullCone,
            "external port tracks local port 1:1",
        );
    }

    let ports_distinct = successful
        .iter()
        .enumerate()
        .all(|(i, (_, a))| successful[i + 1..].iter().all(|(_, b)| a.port != b.port));

    if ports_distinct {
        if deltas.iter().all(|&d| d > 0) {
            NatClassification::new(
                NatType::PortRestricted,
                format!("external ports advance ahead of local ports (deltas {:?})", deltas),
            )
        } else {
            NatClassification::new(NatType::Symmetric, "different ports, hard to punch")
        }
    } else {
        NatClassification::new(NatType::AddressRestricted, "external port reused across servers")
    }
}

/// Runs probes against several servers and classifies the result
pub struct NatClassifier {
    servers: Vec<StunServer>,
    probe_timeout: Duration,
}

impl NatClassifier {
    pub fn new(servers: Vec<StunServer>) -> Self {
        Self {
            servers,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(servers: Vec<StunServer>, probe_timeout: Duration) -> Self {
        Self {
            servers,
            probe_timeout,
        }
    }

    /// Probe from a random base port
    pub async fn classify(&self) -> NatClassification {
        let base_port = rand::thread_rng().gen_range(BASE_PORT_RANGE);
        self.classify_from(base_port).await
    }

    /// Probe from `base_port`, `base_port + 1`, ...
    pub async fn classify_from(&self, base_port: u16) -> NatClassification {
        if self.servers.len() < 2 {
            return NatClassification::new(
                NatType::Unknown,
                "at least two STUN servers are needed",
            );
        }

        let results = self.run_probes(base_port).await;
        let classification = classify_probe_results(&results);
        info!("NAT classification: {}", classification);
        classification
    }

    /// One probe per (server, port) pair, sequentially
    pub async fn run_probes(&self, base_port: u16) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(MAX_PROBES);

        for i in 0..MAX_PROBES {
            let server = &self.servers[i % self.servers.len()];
            let Some(local_port) = base_port.checked_add(i as u16) else {
                break;
            };

            let mapped = match probe(local_port, server, self.probe_timeout).await {
                Ok(mapped) => Some(mapped),
                Err(e) => {
                    debug!("Probe {} from port {} failed: {}", server, local_port, e);
                    None
                }
            };

            results.push(ProbeResult {
                server: server.clone(),
                local_port,
                mapped,
            });
        }

        results
    }
}
