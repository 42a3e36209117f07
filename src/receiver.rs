use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use serde::Serialize;

use crate::{
    channel::{ChannelContext, ReceiveLoop, SendError, SharedBuffer},
    codec::Codec,
    policy::{PolicyError, TransportPolicy},
    socket::DatagramSocket,
};

/// The inbound channel: a socket listening on a port chosen by the policy.
///
/// Incoming datagrams are delivered together with their source endpoint so
/// that handlers can [`reply`](Self::reply) to the peer that sent them.
#[derive(Debug)]
pub struct Receiver<C> {
    socket: Arc<dyn DatagramSocket>,
    buffer: SharedBuffer,
    context: ChannelContext,
    codec: C,
    receive_loop: Option<ReceiveLoop>,
}

impl<C: Codec> Receiver<C> {
    /// Creates a receiving socket for `port` using `policy`.
    pub(crate) fn new(
        policy: &dyn TransportPolicy,
        port: u16,
        context: ChannelContext,
        codec: C,
    ) -> Result<Self, PolicyError> {
        let socket = {
            let _runtime = context.runtime().enter();
            policy.configure_receiver(port)?
        };
        tracing::debug!(local_addr = ?socket.local_addr().ok(), "inbound channel ready");

        Ok(Self {
            socket,
            buffer: context.receive_buffer(),
            context,
            codec,
            receive_loop: None,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts delivering `(source, payload)` pairs to `handler`.
    ///
    /// The handler runs on the runtime's worker threads, one datagram at a
    /// time. Installing a new handler stops the previous one, the new handler
    /// sees its first datagram only after a running call of the previous one
    /// has returned. The loop ends for good when the transport reports an
    /// error.
    pub fn receive<F>(&mut self, handler: F)
    where
        F: FnMut(SocketAddr, Bytes) + Send + 'static,
    {
        self.receive_loop = None;
        self.receive_loop = Some(self.context.spawn_receive_loop(
            self.socket.clone(),
            self.buffer.clone(),
            handler,
        ));
    }

    /// Whether a receive loop is installed and still running.
    pub fn is_receiving(&self) -> bool {
        self.receive_loop
            .as_ref()
            .is_some_and(|receive_loop| !receive_loop.is_finished())
    }

    /// Sends `payload` to `destination` without waiting for delivery.
    ///
    /// Only encoding errors are returned, transport failures are published as
    /// events.
    pub fn reply<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        destination: SocketAddr,
    ) -> Result<(), SendError> {
        self.replier().reply(payload, destination)
    }

    /// A handle for replying from inside a receive handler.
    pub fn replier(&self) -> Replier<C> {
        Replier {
            socket: self.socket.clone(),
            context: self.context.clone(),
            codec: self.codec.clone(),
        }
    }
}

/// Sends replies through an inbound channel's socket.
#[derive(Debug, Clone)]
pub struct Replier<C> {
    socket: Arc<dyn DatagramSocket>,
    context: ChannelContext,
    codec: C,
}

impl<C: Codec> Replier<C> {
    /// See [`Receiver::reply`].
    pub fn reply<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        destination: SocketAddr,
    ) -> Result<(), SendError> {
        let bytes = self.context.encode(&self.codec, payload)?;
        self.context.fire(self.socket.clone(), bytes, destination);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        codec::BincodeCodec, events::EventSink, memory::MemoryNetwork, test::*,
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::{runtime::Handle, sync::mpsc};

    fn context() -> ChannelContext {
        let (events, _) = EventSink::bounded(16);
        ChannelContext::new(Handle::current(), 64, events)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replies_reach_the_requesting_peer() -> Result<()> {
        let network = MemoryNetwork::new();
        let policy = network.broadcast();
        let codec = BincodeCodec::default();

        let mut receiver = Receiver::new(&policy, 9000, context(), codec)?;
        let (peer, destination) = policy.resolve_sender(9000)?;

        let replier = receiver.replier();
        receiver.receive(move |source, payload| {
            let request: u32 = codec.decode(&payload).unwrap();
            replier.reply(&(request + 1), source).unwrap();
        });
        assert!(receiver.is_receiving());

        peer.send_to(&codec.encode(&41u32)?, destination).await?;

        let mut buffer = [0; 64];
        let (len, source) =
            tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buffer)).await??;
        assert_eq!(codec.decode::<u32>(&buffer[..len])?, 42);
        assert_eq!(source, receiver.local_addr()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn installing_a_handler_replaces_the_previous_one() -> Result<()> {
        let network = MemoryNetwork::new();
        let policy = network.broadcast();
        let mut receiver = Receiver::new(&policy, 9000, context(), BincodeCodec::default())?;
        let (peer, destination) = policy.resolve_sender(9000)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        receiver.receive(move |_, _| {
            let _ = first.send("first");
        });
        receiver.receive(move |_, _| {
            let _ = tx.send("second");
        });

        peer.send_to(b"x", destination).await?;

        let handled = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        assert_eq!(handled, Some("second"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replacing_a_busy_handler_waits_for_it() -> Result<()> {
        init_logger();
        let network = MemoryNetwork::new();
        let policy = network.broadcast();
        let mut receiver = Receiver::new(&policy, 9000, context(), BincodeCodec::default())?;
        let (peer, destination) = policy.resolve_sender(9000)?;

        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let (handled, mut finished) = mpsc::unbounded_channel();
        let handler = |name: &'static str, pause: Duration| {
            let active = active.clone();
            let max_active = max_active.clone();
            let handled = handled.clone();
            move |_: SocketAddr, payload: Bytes| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(pause);
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = handled.send((name, payload));
            }
        };

        receiver.receive(handler("slow", Duration::from_millis(200)));
        peer.send_to(b"1", destination).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        receiver.receive(handler("fast", Duration::ZERO));
        peer.send_to(b"2", destination).await?;

        let mut order = Vec::new();
        for _ in 0..2 {
            let next = tokio::time::timeout(Duration::from_secs(1), finished.recv())
                .await?
                .ok_or("handlers dropped")?;
            order.push(next);
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(
            order,
            [
                ("slow", Bytes::from_static(b"1")),
                ("fast", Bytes::from_static(b"2"))
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn oversized_replies_are_rejected() -> Result<()> {
        let network = MemoryNetwork::new();
        let receiver = Receiver::new(
            &network.broadcast(),
            9000,
            context(),
            BincodeCodec::default(),
        )?;

        let result = receiver.reply(&vec![1u8; 128], SocketAddr::from(([10, 0, 0, 9], 1)));
        assert!(matches!(
            result,
            Err(SendError::Oversized { capacity: 64, .. })
        ));
        Ok(())
    }
}
