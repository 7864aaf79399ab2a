use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Listener for the shared fabric port. `SO_REUSEADDR` is set before binding
///  so every node on the host can bind the same port, which is how all of
///  their incoming relays hear the same multicast traffic.
pub fn bind_multicast_listener(
    group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket
        .join_multicast_v4(&group, &interface)
        .map_err(|e| anyhow!("cannot join multicast group {} on {}: {}", group, interface, e))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Send socket for the fabric. The egress interface is set explicitly, and
///  loopback delivery stays enabled so listeners on the same host (including
///  the sending node's own relay) receive what is sent.
pub fn bind_multicast_sender(interface: Ipv4Addr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_if_v4(&interface)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Binds the first free loopback port at or above `base`, probing
///  sequentially. Returns the bound socket together with its port, so there
///  is no window in which another binder could take the probed port.
pub async fn bind_first_free_local_port(base: u16) -> anyhow::Result<(UdpSocket, u16)> {
    for port in base..=u16::MAX {
        match UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(socket) => return Ok((socket, port)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    bail!("no free local port at or above {}", base)
}

/// Ephemeral loopback socket for the node-internal unicast legs.
pub async fn bind_local_sender() -> anyhow::Result<UdpSocket> {
    Ok(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?)
}

/// One receive attempt bounded by `poll`. `None` means the window elapsed
///  without a datagram, giving the caller a chance to check its deactivation
///  flag before the next attempt. Datagrams longer than the buffer's
///  capacity are silently cut off.
pub async fn poll_recv(
    socket: &UdpSocket,
    poll: Duration,
    buf: &mut BytesMut,
) -> Option<std::io::Result<usize>> {
    match timeout(poll, socket.recv_buf(buf)).await {
        Ok(result) => Some(result),
        Err(_elapsed) => None,
    }
}
