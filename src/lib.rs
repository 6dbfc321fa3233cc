//! holepunch - direct peer-to-peer paths through NAT
//!
//! This library discovers the externally mapped address with STUN,
//! classifies the NAT in front of us and punches UDP or TCP holes towards
//! a peer whose address was exchanged out of band.

pub mod config;
pub mod controller;
pub mod network;
pub mod protocol;

pub use config::Config;
pub use controller::{PunchRequest, SessionController, SessionOutcome};
pub use network::{NatClassifier, NatType, PunchSession};
pub use protocol::MappedAddress;
