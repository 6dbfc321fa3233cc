//! Network error types

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Timed out")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Cancelled")]
    Cancelled,

    #[error("Failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("STUN failed: {0}")]
    StunFailed(String),

    #[error("Invalid STUN server '{0}', expected host:port")]
    InvalidStunServer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// IO errors a middlebox can provoke at any time (ICMP unreachable, resets)
pub(crate) fn is_transient_io(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::AddrNotAvailable
    )
}
