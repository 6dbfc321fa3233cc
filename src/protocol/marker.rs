//! Control markers exchanged while punching
//!
//! Markers only exist to open NAT state on the path; they are never shown to
//! the user. Everything else on the wire is an application message.

/// Keep-alive / punch payload for UDP
pub const HOLE_PUNCH: &[u8] = b"HOLE_PUNCH";

/// Greeting sent once on a freshly established TCP stream
pub const TCP_PUNCH: &[u8] = b"TCP_PUNCH";

/// Check whether a UDP datagram is punch traffic
pub fn is_hole_punch(payload: &[u8]) -> bool {
    payload == HOLE_PUNCH
}

/// Removes the `TCP_PUNCH` greeting from the start of a TCP stream
///
/// The peer sends the greeting once, right after the stream is established,
/// and it may arrive split across reads. Anything after it, including later
/// occurrences of the marker text, is application data. A stream that does
/// not start with the greeting is passed through untouched.
#[derive(Debug, Default)]
pub struct GreetingFilter {
    matched: usize,
    done: bool,
}

impl GreetingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received chunk, returning its application bytes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.done {
            return chunk.to_vec();
        }

        for (i, &byte) in chunk.iter().enumerate() {
            if byte == TCP_PUNCH[self.matched] {
                self.matched += 1;
                if self.matched == TCP_PUNCH.len() {
                    self.done = true;
                    return chunk[i + 1..].to_vec();
                }
            } else {
                // No greeting: give back what was held and the rest
                self.done = true;
                let mut out = TCP_PUNCH[..self.matched].to_vec();
                out.extend_from_slice(&chunk[i..]);
                return out;
            }
        }

        Vec::new()
    }
}
