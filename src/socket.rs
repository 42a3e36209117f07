use std::{fmt::Debug, io, net::SocketAddr};

use async_trait::async_trait;

/// A socket that sends and receives whole datagrams.
///
/// Transport policies hand out sockets behind this trait so that channels work
/// the same on a real network and on an in-memory one.
#[async_trait]
pub trait DatagramSocket: Debug + Send + Sync {
    /// Sends one datagram to `target`.
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Waits for the next datagram and copies it into `buffer`.
    ///
    /// Datagrams larger than `buffer` are truncated.
    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for tokio::net::UdpSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, payload, target).await
    }

    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buffer).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

/// Hands a configured `socket2` socket over to the tokio reactor.
///
/// Must be called from within a tokio runtime context.
pub(crate) fn into_tokio(socket: socket2::Socket) -> io::Result<tokio::net::UdpSocket> {
    socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test]
    async fn udp_socket_exchanges_datagrams_through_the_trait() -> crate::test::Result<()> {
        let loopback = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let a: Box<dyn DatagramSocket> = Box::new(tokio::net::UdpSocket::bind(loopback).await?);
        let b: Box<dyn DatagramSocket> = Box::new(tokio::net::UdpSocket::bind(loopback).await?);

        let sent = a.send_to(b"ping", b.local_addr()?).await?;
        assert_eq!(sent, 4);

        let mut buffer = [0; 16];
        let (len, source) = b.recv_from(&mut buffer).await?;
        assert_eq!(&buffer[..len], b"ping");
        assert_eq!(source, a.local_addr()?);
        Ok(())
    }

    #[tokio::test]
    async fn configured_socket2_socket_is_usable_from_tokio() -> crate::test::Result<()> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0)).into())?;

        let socket = into_tokio(socket)?;
        assert!(socket.local_addr()?.port() != 0);
        Ok(())
    }
}
