//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket`, connected to
//! the switcher so sends and receives do not carry addresses. All protocol
//! logic lives elsewhere; this module owns only datagram I/O.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

/// A connected, packet-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared between the receive
/// loop and sending callers; UDP datagram semantics keep concurrent sends
/// whole.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (OS-assigned ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind an ephemeral local port and connect to `peer`.
    pub async fn connect(peer: SocketAddr) -> io::Result<Self> {
        let bind_ip: IpAddr = if peer.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let inner = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        inner.connect(peer).await?;
        let local_addr = inner.local_addr()?;
        Ok(Socket { local_addr, inner })
    }

    /// Send one datagram to the connected peer.
    pub async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.inner.send(datagram).await?;
        Ok(())
    }

    /// Receive the next datagram into `buf`; returns the datagram length.
    ///
    /// Datagrams larger than `buf` are truncated by the OS and will fail the
    /// packet-length check downstream, which is the intended drop path.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf).await
    }
}
