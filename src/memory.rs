//! An in-process virtual network with guaranteed delivery.
//!
//! Real broadcast and multicast traffic is lossy and depends on the host's
//! network setup. [`MemoryNetwork`] provides [`TransportPolicy`]
//! implementations with the same addressing rules but backed by in-memory
//! queues, so fan-out can be tested deterministically and several
//! communicators can share a "network" inside one process.
//!
//! ```
//! use fanout::{memory::MemoryNetwork, Communicator};
//! use std::time::Duration;
//!
//! let network = MemoryNetwork::new();
//!
//! let mut responder = Communicator::new(network.broadcast())?;
//! responder.inbound(9000)?.process(|_, x: i32| x * 2);
//!
//! let mut requester = Communicator::new(network.broadcast())?;
//! let mut replies = Vec::new();
//! requester
//!     .outbound(9000)?
//!     .distribute(&21)?
//!     .collect(Duration::from_millis(50), |reply: i32| replies.push(reply));
//! assert_eq!(replies, [42]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Every bound socket gets its own virtual host address in `10.0.0.0/8`.
//! Receivers keep the requested port while senders get ephemeral ports.

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicU16, AtomicU32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::{
    policy::{PolicyError, TransportPolicy},
    socket::DatagramSocket,
};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

type Datagram = (Bytes, SocketAddr);

#[derive(Debug)]
struct Binding {
    inbox: mpsc::UnboundedSender<Datagram>,
    broadcast_enabled: bool,
    listens_for_broadcast: bool,
    groups: Vec<Ipv4Addr>,
}

impl Binding {
    fn accepts(&self, local: &SocketAddr, destination: &SocketAddrV4) -> bool {
        if local.port() != destination.port() {
            return false;
        }
        let ip = *destination.ip();
        if ip == Ipv4Addr::BROADCAST {
            self.listens_for_broadcast
        } else if ip.is_multicast() {
            self.groups.contains(&ip)
        } else {
            local.ip() == ip
        }
    }
}

#[derive(Debug)]
struct Registry {
    bindings: DashMap<SocketAddr, Binding, ahash::RandomState>,
    next_host: AtomicU32,
    next_ephemeral_port: AtomicU16,
}

impl Registry {
    fn next_host(&self) -> Ipv4Addr {
        let n = self.next_host.fetch_add(1, Ordering::Relaxed);
        Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 0, 0)) | (n & 0x00ff_ffff))
    }

    fn next_ephemeral_port(&self) -> u16 {
        let port = self.next_ephemeral_port.fetch_add(1, Ordering::Relaxed);
        if port < FIRST_EPHEMERAL_PORT {
            // wrapped around
            self.next_ephemeral_port
                .store(FIRST_EPHEMERAL_PORT + 1, Ordering::Relaxed);
            FIRST_EPHEMERAL_PORT
        } else {
            port
        }
    }

    fn deliver(&self, source: SocketAddr, payload: &[u8], destination: SocketAddr) -> io::Result<()> {
        let SocketAddr::V4(destination) = destination else {
            return Err(io::ErrorKind::AddrNotAvailable.into());
        };

        if *destination.ip() == Ipv4Addr::BROADCAST {
            let allowed = self
                .bindings
                .get(&source)
                .map(|binding| binding.broadcast_enabled)
                .unwrap_or(false);
            if !allowed {
                return Err(io::ErrorKind::PermissionDenied.into());
            }
        }

        let payload = Bytes::copy_from_slice(payload);
        let mut delivered = 0;
        for entry in self.bindings.iter() {
            if entry.value().accepts(entry.key(), &destination)
                && entry.value().inbox.send((payload.clone(), source)).is_ok()
            {
                delivered += 1;
            }
        }
        tracing::trace!(%source, %destination, delivered, "virtual datagram routed");
        Ok(())
    }
}

/// A shared in-memory network.
///
/// Cloning yields another handle to the same network.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    registry: Arc<Registry>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                bindings: DashMap::with_hasher(ahash::RandomState::new()),
                next_host: AtomicU32::new(1),
                next_ephemeral_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// A broadcast policy on this network.
    pub fn broadcast(&self) -> MemoryBroadcast {
        MemoryBroadcast {
            network: self.clone(),
        }
    }

    /// A multicast policy for `group` on this network.
    pub fn multicast(&self, group: Ipv4Addr) -> Result<MemoryMulticast, PolicyError> {
        if !group.is_multicast() {
            return Err(PolicyError::NotAMulticastAddress(group));
        }
        Ok(MemoryMulticast {
            network: self.clone(),
            group,
        })
    }

    /// Addresses of all sockets currently bound to this network.
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.registry
            .bindings
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    /// Detaches the socket bound to `addr` from the network.
    ///
    /// Its pending and future receives fail. Returns whether a socket was
    /// bound to `addr`.
    pub fn unbind(&self, addr: SocketAddr) -> bool {
        self.registry.bindings.remove(&addr).is_some()
    }

    fn bind(&self, port: Option<u16>, binding: BindingOptions) -> Arc<MemorySocket> {
        let port = port.unwrap_or_else(|| self.registry.next_ephemeral_port());
        let local_addr = SocketAddr::V4(SocketAddrV4::new(self.registry.next_host(), port));
        let (inbox, receiver) = mpsc::unbounded_channel();

        self.registry.bindings.insert(
            local_addr,
            Binding {
                inbox,
                broadcast_enabled: binding.broadcast_enabled,
                listens_for_broadcast: binding.listens_for_broadcast,
                groups: binding.groups,
            },
        );
        tracing::trace!(%local_addr, "virtual socket bound");

        Arc::new(MemorySocket {
            registry: self.registry.clone(),
            local_addr,
            inbox: Mutex::new(receiver),
        })
    }
}

#[derive(Default)]
struct BindingOptions {
    broadcast_enabled: bool,
    listens_for_broadcast: bool,
    groups: Vec<Ipv4Addr>,
}

/// A datagram socket on a [`MemoryNetwork`].
pub struct MemorySocket {
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySocket")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.registry.bindings.remove(&self.local_addr);
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.registry.deliver(self.local_addr, payload, target)?;
        Ok(payload.len())
    }

    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((payload, source)) => {
                let len = payload.len().min(buffer.len());
                buffer[..len].copy_from_slice(&payload[..len]);
                Ok((len, source))
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Broadcast on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryBroadcast {
    network: MemoryNetwork,
}

impl TransportPolicy for MemoryBroadcast {
    fn configure_receiver(&self, port: u16) -> Result<Arc<dyn DatagramSocket>, PolicyError> {
        Ok(self.network.bind(
            Some(port),
            BindingOptions {
                listens_for_broadcast: true,
                ..Default::default()
            },
        ))
    }

    fn resolve_sender(
        &self,
        port: u16,
    ) -> Result<(Arc<dyn DatagramSocket>, SocketAddr), PolicyError> {
        let socket: Arc<dyn DatagramSocket> = self.network.bind(
            None,
            BindingOptions {
                broadcast_enabled: true,
                ..Default::default()
            },
        );
        Ok((
            socket,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        ))
    }
}

/// Multicast to one group on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryMulticast {
    network: MemoryNetwork,
    group: Ipv4Addr,
}

impl TransportPolicy for MemoryMulticast {
    fn configure_receiver(&self, port: u16) -> Result<Arc<dyn DatagramSocket>, PolicyError> {
        Ok(self.network.bind(
            Some(port),
            BindingOptions {
                groups: vec![self.group],
                ..Default::default()
            },
        ))
    }

    fn resolve_sender(
        &self,
        port: u16,
    ) -> Result<(Arc<dyn DatagramSocket>, SocketAddr), PolicyError> {
        let socket: Arc<dyn DatagramSocket> = self.network.bind(None, BindingOptions::default());
        Ok((
            socket,
            SocketAddr::V4(SocketAddrV4::new(self.group, port)),
        ))
    }
}
