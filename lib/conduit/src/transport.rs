//! Datagram transport capability. The protocol core only ever touches this
//! seam; production uses a non-blocking UDP socket, tests use an in-memory
//! router with loss and latency controls.

use crate::shared::NetResult;
use std::net::SocketAddr;

/// Largest datagram an endpoint will read in one go.
pub const MAX_DATAGRAM: usize = 65_536;

pub trait Transport {
    /// Sends one datagram to the given address.
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> NetResult<()>;

    /// Receives one datagram, returning `Err(Wait)` when none is ready.
    fn recv_from(&mut self, buffer: &mut [u8]) -> NetResult<(usize, SocketAddr)>;

    fn local_addr(&self) -> NetResult<SocketAddr>;
}

/// Non-blocking UDP socket transport.
pub struct UdpTransport {
    socket: mio::net::UdpSocket,
}

impl UdpTransport {
    pub fn bind(address: &str) -> NetResult<UdpTransport> {
        let socket = mio::net::UdpSocket::bind(&address.parse::<SocketAddr>()?)?;

        Ok(UdpTransport { socket })
    }
}

impl Transport for UdpTransport {
    #[inline]
    fn send_to(&mut self, datagram: &[u8], addr: SocketAddr) -> NetResult<()> {
        self.socket.send_to(datagram, &addr)?;
        Ok(())
    }

    #[inline]
    fn recv_from(&mut self, buffer: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        self.socket.recv_from(buffer).map_err(Into::into)
    }

    #[inline]
    fn local_addr(&self) -> NetResult<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }
}
