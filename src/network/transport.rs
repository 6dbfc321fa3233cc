//! Socket construction with address/port reuse
//!
//! Hole punching binds several sockets to one local port: the STUN probe,
//! then the punch socket, and for TCP a listener plus a fresh connector per
//! attempt. All of them go through `socket2` so options are set before
//! `bind`. Only TCP sockets share a port; a UDP port is free again as soon
//! as its socket is dropped, and a second live UDP socket on it must fail.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tracing::debug;

use super::error::NetworkError;

/// Backlog for the punch listener; one peer, one connection
const LISTEN_BACKLOG: i32 = 1;

/// Wildcard IPv4 address for a local port
pub fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
}

fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol, share_port: bool) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;

    if share_port {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }

    // Set non-blocking mode for async operation
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket)
}

fn bind_error(addr: SocketAddr) -> impl FnOnce(std::io::Error) -> NetworkError {
    move |source| NetworkError::Bind {
        port: addr.port(),
        source,
    }
}

/// Bind an exclusive UDP socket; a port in use is a `Bind` error
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP, false).map_err(bind_error(addr))?;

    // Convert to Tokio UdpSocket
    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;

    debug!("UDP socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Bind and listen on a TCP port that connectors may share
pub fn bind_tcp_listener(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP, true).map_err(bind_error(addr))?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error(addr))?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    debug!("TCP listener bound to {} (reuse enabled)", listener.local_addr()?);
    Ok(listener)
}

/// Create an unconnected TCP socket bound to `addr`, ready for `connect`
pub fn bind_tcp_connector(addr: SocketAddr) -> Result<TcpSocket, NetworkError> {
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP, true).map_err(bind_error(addr))?;
    socket.set_nodelay(true)?;

    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpSocket::from_std_stream(std_stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let socket = bind_udp(loopback(0)).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    /// Rebinding right after drop works
    #[tokio::test]
    async fn test_udp_rebind_after_drop() {
        let socket = bind_udp(loopback(0)).unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        for i in 0..3 {
            let socket = bind_udp(loopback(port));
            assert!(socket.is_ok(), "Rebind attempt {} should succeed", i + 1);
        }
    }

    #[tokio::test]
    async fn test_udp_busy_port_is_bind_error() {
        let socket = bind_udp(loopback(0)).unwrap();
        let port = socket.local_addr().unwrap().port();

        let second = bind_udp(loopback(port));
        assert!(matches!(second, Err(NetworkError::Bind { port: p, .. }) if p == port));
    }

    /// A connector can share the port of a live listener
    #[tokio::test]
    async fn test_tcp_listener_and_connector_share_port() {
        let listener = bind_tcp_listener(loopback(0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = bind_tcp_listener(loopback(0)).unwrap();
        let target_addr = target.local_addr().unwrap();

        let connector = bind_tcp_connector(loopback(port)).unwrap();
        let stream = connector.connect(target_addr).await.unwrap();
        assert_eq!(stream.local_addr().unwrap().port(), port);

        let (_accepted, from) = target.accept().await.unwrap();
        assert_eq!(from.port(), port);
        drop(listener);
    }
}
