//! The transport facade: UDP bind, multicast group join/leave, and
//! address resolution. This is the crate's one seam onto a real
//! socket — everything above this module deals only in bytes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::byte::multicast_addr;
use crate::error::Error;

/// Bind a UDP socket on `host:port`. `host` may be an IPv4 literal,
/// hostname, or the empty string for "all interfaces".
pub async fn bind(host: &str, port: u16) -> Result<UdpSocket, Error> {
    let addr = resolve(host, port)?;

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(Error::Bind)?;

    socket.set_reuse_address(true).map_err(Error::Bind)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true).map_err(Error::Bind)?;
    // Multicast receive buffer raised to reduce loss, per the wire spec.
    socket.set_recv_buffer_size(3 * 638).map_err(Error::Bind)?;

    socket.bind(&addr.into()).map_err(Error::Bind)?;
    socket.set_nonblocking(true).map_err(Error::Bind)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(Error::Bind)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|_| Error::ResolveAddress(host.to_string()))?
    };
    Ok(SocketAddr::new(ip, port))
}

/// Resolve a unicast destination of the form `host` (port is always
/// the well-known sACN port).
pub fn resolve_destination(host: &str) -> Result<SocketAddr, Error> {
    resolve(host, crate::byte::SACN_PORT)
}

/// Join the multicast group for `universe` on the given socket.
pub fn join_multicast(
    socket: &UdpSocket,
    universe: u16,
    interface: Option<Ipv4Addr>,
) -> Result<(), Error> {
    let group = multicast_addr(universe);
    let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(group, iface).map_err(Error::Io)
}

/// Leave the multicast group for `universe` on the given socket.
pub fn leave_multicast(
    socket: &UdpSocket,
    universe: u16,
    interface: Option<Ipv4Addr>,
) -> Result<(), Error> {
    let group = multicast_addr(universe);
    let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.leave_multicast_v4(group, iface).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_empty_host_is_unspecified() {
        let addr = resolve("", 5568).unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(addr.port(), 5568);
    }

    #[test]
    fn resolve_rejects_garbage_host() {
        assert!(resolve("not-an-ip-and-no-dns-here", 5568).is_err());
    }

    #[tokio::test]
    async fn bind_on_loopback_succeeds() {
        let socket = bind("127.0.0.1", 0).await.unwrap();
        assert!(socket.local_addr().is_ok());
    }
}
