use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::Serialize;

use crate::{
    channel::{ChannelContext, ReceiveLoop, SendError, SharedBuffer},
    codec::Codec,
    policy::{PolicyError, TransportPolicy},
    socket::DatagramSocket,
};

/// The outbound channel: a socket with a destination fixed at construction.
///
/// Replies to sent payloads arrive on the same socket and can be consumed
/// with [`receive`](Self::receive) or [`receive_for`](Self::receive_for).
#[derive(Debug)]
pub struct Sender<C> {
    socket: Arc<dyn DatagramSocket>,
    destination: SocketAddr,
    buffer: SharedBuffer,
    context: ChannelContext,
    codec: C,
    receive_loop: Option<ReceiveLoop>,
}

impl<C: Codec> Sender<C> {
    /// Creates a sending socket and resolves the destination for `port`.
    pub(crate) fn new(
        policy: &dyn TransportPolicy,
        port: u16,
        context: ChannelContext,
        codec: C,
    ) -> Result<Self, PolicyError> {
        let (socket, destination) = {
            let _runtime = context.runtime().enter();
            policy.resolve_sender(port)?
        };
        tracing::debug!(
            local_addr = ?socket.local_addr().ok(),
            %destination,
            "outbound channel ready"
        );

        Ok(Self {
            socket,
            destination,
            buffer: context.receive_buffer(),
            context,
            codec,
            receive_loop: None,
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sends `payload` to the destination without waiting for delivery.
    ///
    /// Only encoding errors are returned, transport failures are published as
    /// events.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), SendError> {
        let bytes = self.context.encode(&self.codec, payload)?;
        self.context.fire(self.socket.clone(), bytes, self.destination);
        Ok(())
    }

    /// Starts delivering replies to `handler` on the runtime's worker threads.
    ///
    /// Installing a new handler stops the previous one.
    pub fn receive<F>(&mut self, mut handler: F)
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        self.receive_loop = None;
        self.receive_loop = Some(self.context.spawn_receive_loop(
            self.socket.clone(),
            self.buffer.clone(),
            move |_, payload| handler(payload),
        ));
    }

    /// Delivers replies to `handler` until `window` has elapsed.
    ///
    /// The returned future always takes the full window. Any loop installed
    /// with [`receive`](Self::receive) is stopped first so that the socket has
    /// a single reader.
    pub fn receive_for<'a, F>(
        &'a mut self,
        window: Duration,
        mut handler: F,
    ) -> impl Future<Output = ()> + 'a
    where
        F: FnMut(Bytes) + 'a,
    {
        self.receive_from_for(window, move |_, payload| handler(payload))
    }

    /// Like [`receive_for`](Self::receive_for), but `handler` also gets the
    /// replying peer.
    pub(crate) fn receive_from_for<'a, F>(
        &'a mut self,
        window: Duration,
        handler: F,
    ) -> impl Future<Output = ()> + 'a
    where
        F: FnMut(SocketAddr, Bytes) + 'a,
    {
        self.receive_loop = None;
        self.context
            .receive_for(self.socket.clone(), self.buffer.clone(), window, handler)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        codec::BincodeCodec, events::EventSink, memory::MemoryNetwork, test::*,
    };
    use std::{
        net::Ipv4Addr,
        sync::{Arc, Mutex},
        time::Instant,
    };
    use tokio::runtime::Handle;

    fn context() -> ChannelContext {
        let (events, _) = EventSink::bounded(16);
        ChannelContext::new(Handle::current(), 64, events)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_fans_out_to_all_group_members() -> Result<()> {
        let network = MemoryNetwork::new();
        let policy = network.multicast(Ipv4Addr::new(239, 1, 1, 1))?;
        let codec = BincodeCodec::default();

        let members = (0..3)
            .map(|_| policy.configure_receiver(6000))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let sender = Sender::new(&policy, 6000, context(), codec)?;
        assert_eq!(
            sender.destination(),
            SocketAddr::from((Ipv4Addr::new(239, 1, 1, 1), 6000))
        );

        sender.send("tick")?;

        for member in &members {
            let mut buffer = [0; 64];
            let (len, source) =
                tokio::time::timeout(Duration::from_secs(1), member.recv_from(&mut buffer))
                    .await??;
            assert_eq!(codec.decode::<String>(&buffer[..len])?, "tick");
            assert_eq!(source, sender.local_addr()?);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawned_receive_sees_replies() -> Result<()> {
        let network = MemoryNetwork::new();
        let policy = network.broadcast();
        let responder = policy.configure_receiver(9000)?;
        let mut sender = Sender::new(&policy, 9000, context(), BincodeCodec::default())?;

        let replies = Arc::new(Mutex::new(Vec::new()));
        sender.receive({
            let replies = replies.clone();
            move |payload| replies.lock().unwrap().push(payload)
        });

        responder
            .send_to(b"pong", sender.local_addr()?)
            .await?;

        assert!(eventually(|| !replies.lock().unwrap().is_empty()).await);
        assert_eq!(*replies.lock().unwrap(), vec![Bytes::from_static(b"pong")]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_for_blocks_for_the_whole_window() -> Result<()> {
        let network = MemoryNetwork::new();
        let mut sender = Sender::new(
            &network.broadcast(),
            9000,
            context(),
            BincodeCodec::default(),
        )?;

        let mut replies = 0;
        let started = Instant::now();
        sender
            .receive_for(Duration::from_millis(60), |_| replies += 1)
            .await;

        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(replies, 0);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_payloads_are_not_sent() -> Result<()> {
        let network = MemoryNetwork::new();
        let sender = Sender::new(&network.broadcast(), 9000, context(), BincodeCodec::default())?;

        assert!(matches!(
            sender.send(&"x".repeat(100)),
            Err(SendError::Oversized { capacity: 64, .. })
        ));
        Ok(())
    }
}
