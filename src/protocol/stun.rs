//! STUN binding codec
//!
//! Implements the subset of RFC 5389 (and the older RFC 3489) needed to
//! learn our externally mapped address: Binding Request encoding and
//! MAPPED-ADDRESS / XOR-MAPPED-ADDRESS decoding. Everything here is pure,
//! no sockets involved.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// STUN message types
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

/// STUN attribute types
pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Size of the fixed STUN message header
pub const HEADER_SIZE: usize = 20;

/// Address family value for IPv4
const FAMILY_IPV4: u8 = 0x01;

/// Length of an IPv4 address attribute value
const IPV4_ATTR_LEN: usize = 8;

/// Externally visible address reported by a STUN server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappedAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl MappedAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for MappedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV4> for MappedAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

/// One outstanding binding request
///
/// Carries no retry state: a retry is simply a new transaction.
#[derive(Debug, Clone)]
pub struct StunTransaction {
    transaction_id: [u8; 12],
    created_at: Instant,
}

impl StunTransaction {
    /// Start a transaction with a random id
    pub fn new() -> Self {
        Self::with_id(rand::random())
    }

    pub fn with_id(transaction_id: [u8; 12]) -> Self {
        Self {
            transaction_id,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &[u8; 12] {
        &self.transaction_id
    }

    /// Time since the transaction was created
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Encode the Binding Request for this transaction
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        encode_binding_request(&self.transaction_id)
    }

    /// Check whether a response belongs to this transaction
    pub fn matches(&self, response: &[u8]) -> bool {
        response.len() >= HEADER_SIZE && response[8..HEADER_SIZE] == self.transaction_id
    }
}

impl Default for StunTransaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a STUN binding request message (header only, no attributes)
pub fn encode_binding_request(transaction_id: &[u8; 12]) -> [u8; HEADER_SIZE] {
    let mut msg = [0u8; HEADER_SIZE];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Message length stays 0
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction_id);
    msg
}

/// Build a binding success response carrying both MAPPED-ADDRESS and
/// XOR-MAPPED-ADDRESS for `mapped`
pub fn encode_binding_response(transaction_id: &[u8; 12], mapped: MappedAddress) -> Vec<u8> {
    let attrs_len = 2 * (4 + IPV4_ATTR_LEN);
    let mut msg = Vec::with_capacity(HEADER_SIZE + attrs_len);

    msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    msg.extend_from_slice(&(attrs_len as u16).to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);

    msg.extend_from_slice(&MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&(IPV4_ATTR_LEN as u16).to_be_bytes());
    msg.push(0);
    msg.push(FAMILY_IPV4);
    msg.extend_from_slice(&mapped.port.to_be_bytes());
    msg.extend_from_slice(&mapped.ip.octets());

    let xor_port = mapped.port ^ (MAGIC_COOKIE >> 16) as u16;
    let xor_addr = u32::from(mapped.ip) ^ MAGIC_COOKIE;
    msg.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&(IPV4_ATTR_LEN as u16).to_be_bytes());
    msg.push(0);
    msg.push(FAMILY_IPV4);
    msg.extend_from_slice(&xor_port.to_be_bytes());
    msg.extend_from_slice(&xor_addr.to_be_bytes());

    msg
}

/// Parse the first IPv4 MAPPED-ADDRESS attribute of a STUN message
///
/// Returns `None` for buffers shorter than the header, for messages without
/// a usable MAPPED-ADDRESS, and for truncated attributes. Attributes with a
/// non-IPv4 family are skipped.
pub fn decode_mapped_address(data: &[u8]) -> Option<MappedAddress> {
    find_ipv4_attribute(data, MAPPED_ADDRESS, |value| {
        let port = u16::from_be_bytes([value[2], value[3]]);
        let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
        MappedAddress::new(ip, port)
    })
}

/// Parse the first IPv4 XOR-MAPPED-ADDRESS attribute of a STUN message
pub fn decode_xor_mapped_address(data: &[u8]) -> Option<MappedAddress> {
    find_ipv4_attribute(data, XOR_MAPPED_ADDRESS, |value| {
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        let addr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
        MappedAddress::new(Ipv4Addr::from(addr), port)
    })
}

/// Server reflexive address: MAPPED-ADDRESS if present, XOR-MAPPED-ADDRESS otherwise
pub fn decode_reflexive_address(data: &[u8]) -> Option<MappedAddress> {
    decode_mapped_address(data).or_else(|| decode_xor_mapped_address(data))
}

fn find_ipv4_attribute<F>(data: &[u8], wanted: u16, parse: F) -> Option<MappedAddress>
where
    F: Fn(&[u8]) -> MappedAddress,
{
    if data.len() < HEADER_SIZE {
        return None;
    }

    let mut offset = HEADER_SIZE;
    while offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;

        if attr_type == wanted && attr_len >= IPV4_ATTR_LEN {
            // Truncated value: nothing further can be trusted
            let value = data.get(value_start..value_start + IPV4_ATTR_LEN)?;
            if value[1] == FAMILY_IPV4 {
                return Some(parse(value));
            }
        }

        // Values are padded to a 4-byte boundary
        offset = value_end + ((4 - attr_len % 4) % 4);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(msg_len: u16) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&msg_len.to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&[7u8; 12]);
        msg
    }

    #[test]
    fn test_build_binding_request() {
        let txn_id = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let request = encode_binding_request(&txn_id);

        assert_eq!(request.len(), 20);
        // Message type
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        // Message length
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        // Magic cookie
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&request[8..20], &txn_id);
    }

    #[test]
    fn test_transaction_ids_are_random() {
        let a = StunTransaction::new();
        let b = StunTransaction::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(&a.encode()[8..20], a.id());
    }

    #[test]
    fn test_transaction_matches_response() {
        let txn = StunTransaction::with_id([9; 12]);
        let response = encode_binding_response(&[9; 12], MappedAddress::new(Ipv4Addr::LOCALHOST, 1));
        assert!(txn.matches(&response));
        assert!(!StunTransaction::with_id([8; 12]).matches(&response));
        assert!(!txn.matches(&response[..10]));
    }

    #[test]
    fn test_decode_short_buffer() {
        for len in 0..HEADER_SIZE {
            assert_eq!(decode_mapped_address(&vec![0u8; len]), None);
        }
    }

    #[test]
    fn test_decode_header_only() {
        assert_eq!(decode_mapped_address(&header(0)), None);
    }

    #[test]
    fn test_decode_mapped_address() {
        let mut msg = header(12);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x08]);
        msg.extend_from_slice(&[0x00, 0x01, 0x9C, 0x40, 203, 0, 113, 5]);

        let mapped = decode_mapped_address(&msg).unwrap();
        assert_eq!(mapped, MappedAddress::new(Ipv4Addr::new(203, 0, 113, 5), 40000));
    }

    #[test]
    fn test_decode_skips_other_attributes() {
        let mut msg = header(0);
        // SOFTWARE attribute, 5 bytes + 3 padding
        msg.extend_from_slice(&[0x80, 0x22, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0, 0, 0]);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x08]);
        msg.extend_from_slice(&[0x00, 0x01, 0x13, 0x88, 10, 0, 0, 1]);

        let mapped = decode_mapped_address(&msg).unwrap();
        assert_eq!(mapped.to_string(), "10.0.0.1:5000");
    }

    #[test]
    fn test_decode_skips_ipv6_family() {
        let mut msg = header(0);
        // IPv6 MAPPED-ADDRESS, 20 byte value
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x14, 0x00, 0x02, 0x13, 0x88]);
        msg.extend_from_slice(&[0u8; 16]);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x08]);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x50, 192, 0, 2, 1]);

        let mapped = decode_mapped_address(&msg).unwrap();
        assert_eq!(mapped.to_string(), "192.0.2.1:80");
    }

    #[test]
    fn test_decode_truncated_attribute() {
        let mut msg = header(12);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x08, 0x00, 0x01, 0x13]);
        assert_eq!(decode_mapped_address(&msg), None);
    }

    #[test]
    fn test_decode_short_attribute_length() {
        let mut msg = header(8);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x04, 0x00, 0x01, 0x13, 0x88]);
        assert_eq!(decode_mapped_address(&msg), None);
    }

    #[test]
    fn test_parse_xor_mapped_address_ipv4() {
        // XOR-MAPPED-ADDRESS for 192.168.1.100:5000
        // XOR port: 5000 (0x1388) ^ 0x2112 = 0x329A
        // XOR addr: 192.168.1.100 (0xC0A80164) ^ 0x2112A442 = 0xE1BAA526
        let mut msg = header(12);
        msg.extend_from_slice(&[0x00, 0x20, 0x00, 0x08]);
        msg.extend_from_slice(&[0x00, 0x01, 0x32, 0x9A, 0xE1, 0xBA, 0xA5, 0x26]);

        assert_eq!(decode_mapped_address(&msg), None);
        let result = decode_reflexive_address(&msg).unwrap();
        assert_eq!(result.port, 5000);
        assert_eq!(result.ip.to_string(), "192.168.1.100");
    }

    #[test]
    fn test_binding_response_round_trip() {
        let mapped = MappedAddress::new(Ipv4Addr::new(198, 51, 100, 23), 61000);
        let response = encode_binding_response(&[3; 12], mapped);

        assert_eq!(decode_mapped_address(&response), Some(mapped));
        assert_eq!(decode_xor_mapped_address(&response), Some(mapped));
    }
}
