//! Datagram transport towards the gateway
//!
//! The client only needs to send a datagram to the gateway and to receive
//! whatever arrives on its bound port. [`Transport`] is that seam; the
//! production implementation is a plain [`tokio::net::UdpSocket`].

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::debug;

/// Raw datagram I/O used by the client event loop
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `target`
    fn send_to(
        &self,
        datagram: &[u8],
        target: SocketAddrV4,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait for the next inbound datagram, returning its length and sender
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl Transport for UdpSocket {
    fn send_to(
        &self,
        datagram: &[u8],
        target: SocketAddrV4,
    ) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            let sent = UdpSocket::send_to(self, datagram, target).await?;
            if sent != datagram.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short send: {} of {} bytes", sent, datagram.len()),
                ));
            }
            Ok(())
        }
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        UdpSocket::recv_from(self, buf)
    }
}

/// Bind the client UDP socket on all IPv4 interfaces
pub async fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
    debug!("Bound NAT-PMP client socket on {}", socket.local_addr()?);
    Ok(socket)
}
