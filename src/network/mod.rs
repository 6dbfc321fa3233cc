//! Network module for NAT traversal
//!
//! Handles STUN probing, NAT classification, UDP/TCP hole punching and the
//! session object that ties a punching attempt together.

mod error;
mod nat;
mod prober;
mod responder;
mod session;
mod state;
mod tcp_punch;
mod transport;
mod udp_punch;

pub use error::NetworkError;
pub use nat::{classify_probe_results, NatClassification, NatClassifier, NatType, ProbeResult};
pub use prober::{
    discover_public_address, probe, StunServer, DEFAULT_PROBE_TIMEOUT, DEFAULT_STUN_SERVERS,
};
pub use responder::StunResponder;
pub use session::{PunchConfig, PunchSession};
pub use state::{
    sleep_unless_cancelled, CancelFlag, PunchMode, PunchState, SessionEvent, StateCallback,
};
pub use transport::{any_addr, bind_tcp_connector, bind_tcp_listener, bind_udp};
pub use udp_punch::punch_targets;
