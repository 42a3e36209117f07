//! Plumbing shared by the inbound and outbound channels.
//!
//! Both channels receive through the same self-re-arming loop: exactly one
//! receive is outstanding on a socket, the received bytes are copied out of the
//! channel's buffer, the handler runs, and only then is the next receive armed.
//! A channel keeps one buffer for its whole life. Successive loops on the
//! channel take turns on it, so a replacement loop only starts receiving once
//! the previous handler has returned.
//! Sends are fire-and-forget tasks that own their encoded bytes until the
//! transport is done with them.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::Serialize;
use tokio::{runtime::Handle, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{Codec, CodecError},
    events::{EventSink, TransportEvent},
    socket::DatagramSocket,
};

/// Indicates that a payload was not handed to the transport.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] CodecError),

    /// The encoded payload does not fit into a single datagram.
    #[error("Payload of {size} bytes exceeds the datagram capacity of {capacity} bytes")]
    Oversized { size: usize, capacity: usize },
}

/// Everything a channel needs besides its socket.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    runtime: Handle,
    capacity: usize,
    events: EventSink,
}

impl ChannelContext {
    /// `capacity` is both the receive buffer size and the largest payload that
    /// will be sent.
    pub fn new(runtime: Handle, capacity: usize, events: EventSink) -> Self {
        Self {
            runtime,
            capacity,
            events,
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    /// A fresh receive buffer of the configured capacity.
    pub(crate) fn receive_buffer(&self) -> SharedBuffer {
        Arc::new(Mutex::new(ReceiveBuffer::new(self.capacity)))
    }

    /// Encodes `payload` and checks that it fits into one datagram.
    pub(crate) fn encode<C: Codec, T: Serialize + ?Sized>(
        &self,
        codec: &C,
        payload: &T,
    ) -> Result<Bytes, SendError> {
        let bytes = codec.encode(payload)?;
        if bytes.len() > self.capacity {
            return Err(SendError::Oversized {
                size: bytes.len(),
                capacity: self.capacity,
            });
        }
        Ok(bytes)
    }

    /// Sends `payload` to `destination` without waiting for the result.
    ///
    /// The task owns `payload` until the send completes. Failures are logged
    /// and published as [`TransportEvent::SendFailed`].
    pub(crate) fn fire(
        &self,
        socket: Arc<dyn DatagramSocket>,
        payload: Bytes,
        destination: SocketAddr,
    ) {
        let events = self.events.clone();
        self.runtime.spawn(async move {
            match socket.send_to(&payload, destination).await {
                Ok(sent) => tracing::trace!(%destination, sent, "sent datagram"),
                Err(err) => {
                    tracing::warn!(%destination, %err, "failed to send datagram");
                    events.emit(TransportEvent::SendFailed {
                        destination,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
        });
    }

    /// Starts a receive loop on the runtime.
    pub(crate) fn spawn_receive_loop<F>(
        &self,
        socket: Arc<dyn DatagramSocket>,
        buffer: SharedBuffer,
        handler: F,
    ) -> ReceiveLoop
    where
        F: FnMut(SocketAddr, Bytes) + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = self.runtime.spawn(receive_loop(
            socket,
            buffer,
            token.clone(),
            self.events.clone(),
            handler,
        ));
        ReceiveLoop { token, task }
    }

    /// Builds a receive loop that runs for `window` when awaited.
    ///
    /// The loop is driven by whoever awaits the returned future, so `handler`
    /// may borrow from the caller.
    pub(crate) fn receive_for<'a, F>(
        &self,
        socket: Arc<dyn DatagramSocket>,
        buffer: SharedBuffer,
        window: Duration,
        handler: F,
    ) -> impl Future<Output = ()> + 'a
    where
        F: FnMut(SocketAddr, Bytes) + 'a,
    {
        let token = CancellationToken::new();
        let timer = token.clone();
        let events = self.events.clone();
        async move {
            tokio::join!(
                async move {
                    tokio::time::sleep(window).await;
                    timer.cancel();
                },
                receive_loop(socket, buffer, token, events, handler),
            );
        }
    }
}

/// A channel's receive buffer, locked by whichever loop is receiving.
pub(crate) type SharedBuffer = Arc<Mutex<ReceiveBuffer>>;

/// Fixed-capacity region a receive loop reads datagrams into.
///
/// Handlers only ever see copies.
#[derive(Debug)]
pub(crate) struct ReceiveBuffer {
    data: Box<[u8]>,
}

impl ReceiveBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
        }
    }

    async fn receive(
        &mut self,
        socket: &dyn DatagramSocket,
    ) -> std::io::Result<(Bytes, SocketAddr)> {
        let (len, source) = socket.recv_from(&mut self.data).await?;
        Ok((Bytes::copy_from_slice(&self.data[..len]), source))
    }
}

async fn receive_loop<F>(
    socket: Arc<dyn DatagramSocket>,
    shared: SharedBuffer,
    token: CancellationToken,
    events: EventSink,
    mut handler: F,
) where
    F: FnMut(SocketAddr, Bytes),
{
    let local = socket.local_addr().ok();
    loop {
        // Held across the receive and the handler call.
        let mut buffer = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::trace!(?local, "receive loop cancelled");
                return;
            }
            buffer = shared.lock() => buffer,
        };
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::trace!(?local, "receive loop cancelled");
                return;
            }
            received = buffer.receive(socket.as_ref()) => received,
        };

        match received {
            Ok((payload, source)) => {
                tracing::trace!(?local, %source, len = payload.len(), "received datagram");
                handler(source, payload);
            }
            Err(err) => {
                tracing::warn!(?local, %err, "receive failed, stopping receive loop");
                events.emit(TransportEvent::ReceiveStopped {
                    local,
                    kind: err.kind(),
                    message: err.to_string(),
                });
                return;
            }
        }
    }
}

/// Handle to a spawned receive loop. Dropping it stops the loop.
#[derive(Debug)]
pub(crate) struct ReceiveLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReceiveLoop {
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
