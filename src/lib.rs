//! Asynchronous 1-to-many communication over UDP broadcast and multicast.
//!
//! This crate provides a small communication primitive for services that fan
//! a request out to a group of peers and aggregate whatever answers arrive in
//! time, and for the peers that answer such requests. Delivery is best-effort:
//! there are no acknowledgements, retries or sequence numbers, and every
//! datagram carries exactly one encoded value.
//!
//! # Patterns
//! - Scatter-gather: a [`Communicator`] with an
//!   [outbound](Communicator::outbound) channel
//!   [distributes](Communicator::distribute) a payload and
//!   [collects](Communicator::collect) replies for a fixed time window.
//! - Responder: a [`Communicator`] with an [inbound](Communicator::inbound)
//!   channel [processes](Communicator::process) requests with a handler whose
//!   return value is sent back to the requester, and
//!   [dispatches](Communicator::dispatch) forever.
//!
//! ```no_run
//! use fanout::{policy::Multicast, Communicator};
//! use std::{net::Ipv4Addr, time::Duration};
//!
//! let group = Multicast::new(Ipv4Addr::new(239, 255, 0, 1))?;
//!
//! // On every replica:
//! let mut replica = Communicator::new(group)?;
//! replica.inbound(9000)?.process(|_, x: i32| x * 2);
//!
//! // On the requesting node:
//! let mut requester = Communicator::new(group)?;
//! let mut answers = Vec::new();
//! requester
//!     .outbound(9000)?
//!     .distribute(&21)?
//!     .collect(Duration::from_millis(10), |x: i32| answers.push(x));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Transports
//! Sockets are created through a [`TransportPolicy`] chosen when the
//! communicator is built: [`Broadcast`](policy::Broadcast) and
//! [`Multicast`](policy::Multicast) for real networks, or the policies of a
//! [`MemoryNetwork`](memory::MemoryNetwork) for deterministic in-process
//! delivery.
//!
//! # Failures
//! Sends are fire-and-forget and receive loops stop on transport errors
//! without involving the caller. These conditions are logged with `tracing`
//! and published as [`TransportEvent`]s, see
//! [`Communicator::events`].
//!
//! # Important Notes
//! <div class="warning">
//! Only IPv4 is supported. Payloads must fit into a single datagram of at most
//! <code>buffer_capacity</code> bytes (4096 by default), larger payloads are
//! rejected.
//! </div>

pub(crate) mod channel;
pub mod codec;
pub mod communicator;
pub mod events;
pub mod memory;
pub mod policy;
pub mod receiver;
pub mod sender;
pub mod socket;
#[cfg(test)]
pub(crate) mod test;

pub use channel::SendError;
pub use codec::{BincodeCodec, Codec};
pub use communicator::{Communicator, CommunicatorConfig, CommunicatorError, State};
pub use events::TransportEvent;
pub use policy::TransportPolicy;
