//! Transport policies decide how sockets are bound and where datagrams go.
//!
//! A policy is chosen once when a [`Communicator`](crate::Communicator) is
//! created and is used for every channel it constructs. Two policies for real
//! networks are provided:
//! - [`Broadcast`]: receivers listen on the wildcard address, senders target
//!   the IPv4 limited broadcast address `255.255.255.255`.
//! - [`Multicast`]: receivers join a multicast group, senders target the group
//!   address.
//!
//! The in-memory network in [`memory`](crate::memory) provides policies with
//! the same semantics for tests.

use std::{
    fmt::Debug,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::socket::{into_tokio, DatagramSocket};

/// Indicates an error while creating a socket for a channel.
#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    /// The group address is not in `224.0.0.0/4`.
    #[error("Invalid multicast address: {0}")]
    NotAMulticastAddress(Ipv4Addr),

    /// Failed to create the socket.
    #[error("Failed to create socket: {0}")]
    SocketCreate(std::io::Error),

    /// Failed to apply a socket option.
    #[error("Failed to set socket option: {0}")]
    SocketOption(std::io::Error),

    /// Failed to bind the socket.
    #[error("Failed to bind socket: {0}")]
    SocketBind(std::io::Error),
}

/// Strategy for configuring receiving and sending sockets.
///
/// Implementations for real sockets register them with tokio and therefore
/// must be called from within a runtime context.
pub trait TransportPolicy: Debug + Send + Sync {
    /// Creates a socket that receives datagrams addressed to `port`.
    fn configure_receiver(&self, port: u16) -> Result<Arc<dyn DatagramSocket>, PolicyError>;

    /// Creates a socket for sending to `port` and resolves the destination.
    fn resolve_sender(
        &self,
        port: u16,
    ) -> Result<(Arc<dyn DatagramSocket>, SocketAddr), PolicyError>;
}

fn udp_socket() -> Result<Socket, PolicyError> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(PolicyError::SocketCreate)
}

fn bind(socket: &Socket, addr: Ipv4Addr, port: u16) -> Result<(), PolicyError> {
    socket
        .bind(&SocketAddr::V4(SocketAddrV4::new(addr, port)).into())
        .map_err(PolicyError::SocketBind)
}

fn register(socket: Socket) -> Result<Arc<dyn DatagramSocket>, PolicyError> {
    Ok(Arc::new(into_tokio(socket).map_err(PolicyError::SocketCreate)?))
}

/// Limited broadcast on the local network segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Broadcast;

impl Broadcast {
    fn receiver_socket(port: u16) -> Result<Socket, PolicyError> {
        let socket = udp_socket()?;
        socket
            .set_reuse_address(true)
            .map_err(PolicyError::SocketOption)?;
        bind(&socket, Ipv4Addr::UNSPECIFIED, port)?;
        Ok(socket)
    }

    fn sender_socket(port: u16) -> Result<(Socket, SocketAddr), PolicyError> {
        let socket = udp_socket()?;
        socket
            .set_broadcast(true)
            .map_err(PolicyError::SocketOption)?;
        bind(&socket, Ipv4Addr::UNSPECIFIED, 0)?;
        Ok((
            socket,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        ))
    }
}

impl TransportPolicy for Broadcast {
    fn configure_receiver(&self, port: u16) -> Result<Arc<dyn DatagramSocket>, PolicyError> {
        let _span = tracing::debug_span!("broadcast_receiver", port).entered();
        let socket = register(Self::receiver_socket(port)?)?;
        tracing::debug!("listening for broadcasts");
        Ok(socket)
    }

    fn resolve_sender(
        &self,
        port: u16,
    ) -> Result<(Arc<dyn DatagramSocket>, SocketAddr), PolicyError> {
        let (socket, destination) = Self::sender_socket(port)?;
        tracing::debug!(%destination, "resolved broadcast destination");
        Ok((register(socket)?, destination))
    }
}

/// IPv4 multicast to a single group.
#[derive(Debug, Clone, Copy)]
pub struct Multicast {
    group: Ipv4Addr,
    listen_address: Ipv4Addr,
    interface: Ipv4Addr,
    ttl: u32,
    loopback: bool,
}

impl Multicast {
    /// Creates a policy for `group`.
    ///
    /// The group must be in the range `224.0.0.0/4` as described in [IETF RFC
    /// 5771](https://tools.ietf.org/html/rfc5771).
    pub fn new(group: Ipv4Addr) -> Result<Self, PolicyError> {
        if !group.is_multicast() {
            return Err(PolicyError::NotAMulticastAddress(group));
        }
        Ok(Self {
            group,
            listen_address: Ipv4Addr::UNSPECIFIED,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            loopback: true,
        })
    }

    /// Address receivers bind to. Defaults to `0.0.0.0`.
    pub fn listen_address(mut self, addr: Ipv4Addr) -> Self {
        self.listen_address = addr;
        self
    }

    /// Interface used to join the group and to send. Defaults to letting the
    /// system choose.
    pub fn interface(mut self, addr: Ipv4Addr) -> Self {
        self.interface = addr;
        self
    }

    /// Time-to-live of outgoing datagrams. Defaults to 1 (local segment).
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Whether sent datagrams are looped back to local receivers. Defaults to
    /// `true`.
    pub fn loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    fn receiver_socket(&self, port: u16) -> Result<Socket, PolicyError> {
        let socket = udp_socket()?;
        socket
            .set_reuse_address(true)
            .map_err(PolicyError::SocketOption)?;
        socket
            .join_multicast_v4(&self.group, &self.interface)
            .map_err(PolicyError::SocketOption)?;
        bind(&socket, self.listen_address, port)?;
        Ok(socket)
    }

    fn sender_socket(&self, port: u16) -> Result<(Socket, SocketAddr), PolicyError> {
        let socket = udp_socket()?;
        socket
            .set_multicast_ttl_v4(self.ttl)
            .map_err(PolicyError::SocketOption)?;
        socket
            .set_multicast_loop_v4(self.loopback)
            .map_err(PolicyError::SocketOption)?;
        if !self.interface.is_unspecified() {
            socket
                .set_multicast_if_v4(&self.interface)
                .map_err(PolicyError::SocketOption)?;
        }
        bind(&socket, Ipv4Addr::UNSPECIFIED, 0)?;
        Ok((
            socket,
            SocketAddr::V4(SocketAddrV4::new(self.group, port)),
        ))
    }
}

impl TransportPolicy for Multicast {
    fn configure_receiver(&self, port: u16) -> Result<Arc<dyn DatagramSocket>, PolicyError> {
        let _span = tracing::debug_span!("multicast_receiver", group = %self.group, port).entered();
        let socket = register(self.receiver_socket(port)?)?;
        tracing::debug!("joined multicast group");
        Ok(socket)
    }

    fn resolve_sender(
        &self,
        port: u16,
    ) -> Result<(Arc<dyn DatagramSocket>, SocketAddr), PolicyError> {
        let (socket, destination) = self.sender_socket(port)?;
        tracing::debug!(%destination, ttl = self.ttl, "resolved multicast destination");
        Ok((register(socket)?, destination))
    }
}
