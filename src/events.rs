//! Observable side channel for failures that do not interrupt delivery.
//!
//! Sends are fire-and-forget and receive loops stop silently on transport
//! errors, so none of these conditions reach the caller as a `Result`. They are
//! logged and additionally published as [`TransportEvent`]s on a bounded
//! channel that a health monitor can drain.

use std::{io, net::SocketAddr};

use crossbeam::channel::{Receiver, Sender, TrySendError};

/// A transport condition that was handled without involving the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A datagram could not be handed to the transport.
    SendFailed {
        destination: SocketAddr,
        kind: io::ErrorKind,
        message: String,
    },

    /// A receive loop hit a transport error and will not be re-armed.
    ReceiveStopped {
        local: Option<SocketAddr>,
        kind: io::ErrorKind,
        message: String,
    },

    /// A datagram did not decode as the expected type and was skipped.
    DecodeFailed {
        source: Option<SocketAddr>,
        message: String,
    },

    /// A handler produced a response that could not be sent back.
    EncodeFailed {
        destination: SocketAddr,
        message: String,
    },
}

/// Publishing side of the event channel.
///
/// Emitting never blocks. Events are dropped while the channel is full.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<TransportEvent>,
}

impl EventSink {
    /// Creates a sink with room for `capacity` undrained events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<TransportEvent>) {
        let (sender, receiver) = crossbeam::channel::bounded(capacity);
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: TransportEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!(?event, "event channel full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_failed(n: u16) -> TransportEvent {
        TransportEvent::DecodeFailed {
            source: Some(SocketAddr::from(([10, 0, 0, 1], n))),
            message: "bad".into(),
        }
    }

    #[test]
    fn emitted_events_are_received_in_order() {
        let (sink, events) = EventSink::bounded(8);
        sink.emit(decode_failed(1));
        sink.emit(decode_failed(2));

        assert_eq!(events.try_recv(), Ok(decode_failed(1)));
        assert_eq!(events.try_recv(), Ok(decode_failed(2)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn full_channel_drops_new_events() {
        let (sink, events) = EventSink::bounded(1);
        sink.emit(decode_failed(1));
        sink.emit(decode_failed(2));

        assert_eq!(events.try_recv(), Ok(decode_failed(1)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn emitting_without_a_receiver_is_harmless() {
        let (sink, events) = EventSink::bounded(1);
        drop(events);
        sink.emit(decode_failed(1));
    }
}
