//! Wire formats
//!
//! STUN binding messages and the punch control markers.

pub mod marker;
pub mod stun;

pub use marker::{GreetingFilter, HOLE_PUNCH, TCP_PUNCH};
pub use stun::{
    decode_mapped_address, decode_reflexive_address, decode_xor_mapped_address,
    encode_binding_request, encode_binding_response, MappedAddress, StunTransaction,
};
