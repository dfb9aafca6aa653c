//! UDP socket construction
//!
//! socket2 is used for the options tokio does not expose before bind
//! (address reuse, multicast membership, TTL); the result is handed to
//! tokio as a non-blocking socket.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// Hop limit for multicast traffic; keeps the stream on the local segment
const MULTICAST_TTL: u32 = 1;

fn new_socket() -> std::io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
}

fn into_tokio(socket: Socket) -> std::io::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn bind_failed(addr: SocketAddrV4) -> impl FnOnce(std::io::Error) -> NetworkError {
    move |source| NetworkError::BindFailed {
        addr: SocketAddr::V4(addr),
        source,
    }
}

/// Bind a unicast socket with `SO_REUSEADDR`, so a restarted session can
/// take the port back immediately.
pub fn bind_reusable(port: u16) -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let build = || -> std::io::Result<UdpSocket> {
        let socket = new_socket()?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        into_tokio(socket)
    };
    build().map_err(bind_failed(addr))
}

/// Bind an ephemeral socket for sending
pub fn bind_ephemeral() -> Result<UdpSocket, NetworkError> {
    bind_reusable(0)
}

/// Socket for sending to a multicast group
pub fn multicast_sender() -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    let build = || -> std::io::Result<UdpSocket> {
        let socket = new_socket()?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        // Clients on this machine hear the stream too
        socket.set_multicast_loop_v4(true)?;
        socket.bind(&addr.into())?;
        into_tokio(socket)
    };
    build().map_err(bind_failed(addr))
}

/// Bind `port` and join `group` on the default interface
pub fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = new_socket().map_err(bind_failed(addr))?;
    socket.set_reuse_address(true).map_err(bind_failed(addr))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_failed(addr))?;
    socket.bind(&addr.into()).map_err(bind_failed(addr))?;

    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| NetworkError::JoinFailed(format!("{}: {}", group, e)))?;

    into_tokio(socket).map_err(bind_failed(addr))
}

/// Errors worth retrying on the same socket. ICMP port-unreachable from an
/// earlier send surfaces as a reset or refusal on some platforms.
pub fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// Leave `group`; errors are logged since the socket is about to close anyway
pub fn leave_multicast(socket: &UdpSocket, group: Ipv4Addr) {
    if let Err(e) = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
        tracing::debug!("Failed to leave multicast group {}: {}", group, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_reusable_twice_after_drop() {
        let socket = bind_reusable(0).unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let again = bind_reusable(port).unwrap();
        assert_eq!(again.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_ephemeral_round_trip() {
        let a = bind_ephemeral().unwrap();
        let b = bind_ephemeral().unwrap();
        let b_port = b.local_addr().unwrap().port();

        a.send_to(b"ping", (Ipv4Addr::LOCALHOST, b_port)).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
