use std::{net::SocketAddr, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{ChannelContext, SendError},
    codec::{BincodeCodec, Codec, MAX_DATAGRAM_SIZE},
    events::{EventSink, TransportEvent},
    policy::{PolicyError, TransportPolicy},
    receiver::Receiver,
    sender::Sender,
};

/// Indicates an error within the communicator configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The buffer capacity is zero.
    #[error("Buffer capacity must be greater than zero")]
    BufferCapacityZero,

    /// The buffer capacity exceeds the largest UDP payload.
    #[error("Buffer capacity too large (maximum is 65507)")]
    BufferCapacityTooLarge,

    /// The runtime would have no worker threads.
    #[error("Worker threads must be greater than zero")]
    WorkerThreadsZero,

    /// The event channel would have no capacity.
    #[error("Event capacity must be greater than zero")]
    EventCapacityZero,
}

/// Additional configuration for a [`Communicator`].
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Capacity of the receive buffers in bytes.
    ///
    /// This is also the largest payload that will be sent, larger encodings
    /// are rejected. Must be between 1 and 65507.
    ///
    /// The default is 4096.
    pub buffer_capacity: usize,

    /// Number of worker threads of the runtime driving all I/O.
    ///
    /// The default is 2.
    pub worker_threads: usize,

    /// Number of undrained [`TransportEvent`]s kept before new ones are
    /// dropped.
    ///
    /// The default is 1024.
    pub event_capacity: usize,
}

impl CommunicatorConfig {
    /// Validates the configuration.
    ///
    /// See [`ConfigError`] for details.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::BufferCapacityZero);
        }

        if self.buffer_capacity > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::BufferCapacityTooLarge);
        }

        if self.worker_threads == 0 {
            return Err(ConfigError::WorkerThreadsZero);
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::EventCapacityZero);
        }
        Ok(())
    }
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 4096,
            worker_threads: 2,
            event_capacity: 1024,
        }
    }
}

/// Indicates an error when configuring or using a [`Communicator`].
#[derive(thiserror::Error, Debug)]
pub enum CommunicatorError {
    /// The configuration is invalid.
    ///
    /// See [`ConfigError`] for details.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to start the runtime.
    #[error("Failed to start runtime: {0}")]
    Runtime(std::io::Error),

    /// Failed to create a channel socket.
    #[error("Failed to create channel: {0}")]
    Policy(#[from] PolicyError),

    /// Failed to hand a payload to the transport.
    #[error("Failed to send: {0}")]
    Send(#[from] SendError),
}

/// Which channels a [`Communicator`] currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconfigured,
    OutboundReady,
    InboundReady,
    Both,
}

/// One-to-many request distribution and response collection over UDP.
///
/// A communicator owns the runtime that drives its I/O and at most one
/// inbound and one outbound channel, both created through the transport
/// policy chosen at construction. It supports two patterns:
///
/// - scatter-gather: [`outbound`](Self::outbound), then
///   [`distribute`](Self::distribute) a request and
///   [`collect`](Self::collect) the replies for a fixed time window;
/// - responder: [`inbound`](Self::inbound), then [`process`](Self::process)
///   requests with a handler whose return value is sent back to the requester,
///   and [`dispatch`](Self::dispatch) to keep serving.
///
/// ```no_run
/// use fanout::{policy::Broadcast, Communicator};
/// use std::time::Duration;
///
/// let mut communicator = Communicator::new(Broadcast)?;
/// let mut bids = Vec::new();
/// communicator
///     .outbound(9000)?
///     .distribute("auction-17")?
///     .collect(Duration::from_millis(10), |bid: u64| bids.push(bid));
/// # Ok::<(), fanout::CommunicatorError>(())
/// ```
pub struct Communicator<C = BincodeCodec> {
    // Channels are declared first so that their loops are cancelled before
    // the runtime shuts down.
    inbound: Option<Receiver<C>>,
    outbound: Option<Sender<C>>,
    policy: Arc<dyn TransportPolicy>,
    codec: C,
    config: CommunicatorConfig,
    context: ChannelContext,
    events: crossbeam::channel::Receiver<TransportEvent>,
    shutdown: CancellationToken,
    runtime: Runtime,
}

impl Communicator<BincodeCodec> {
    /// Creates a communicator with the default configuration.
    pub fn new(policy: impl TransportPolicy + 'static) -> Result<Self, CommunicatorError> {
        Self::with_config(policy, CommunicatorConfig::default())
    }

    pub fn with_config(
        policy: impl TransportPolicy + 'static,
        config: CommunicatorConfig,
    ) -> Result<Self, CommunicatorError> {
        Self::with_codec(policy, config, BincodeCodec::default())
    }
}

impl<C: Codec> Communicator<C> {
    /// Creates a communicator that encodes payloads with `codec`.
    pub fn with_codec(
        policy: impl TransportPolicy + 'static,
        config: CommunicatorConfig,
        codec: C,
    ) -> Result<Self, CommunicatorError> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("fanout-worker")
            .enable_all()
            .build()
            .map_err(CommunicatorError::Runtime)?;

        let (sink, events) = EventSink::bounded(config.event_capacity);
        let context = ChannelContext::new(runtime.handle().clone(), config.buffer_capacity, sink);

        tracing::debug!(?policy, ?config, "communicator created");

        Ok(Self {
            inbound: None,
            outbound: None,
            policy: Arc::new(policy),
            codec,
            config,
            context,
            events,
            shutdown: CancellationToken::new(),
            runtime,
        })
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        match (self.inbound.is_some(), self.outbound.is_some()) {
            (false, false) => State::Unconfigured,
            (false, true) => State::OutboundReady,
            (true, false) => State::InboundReady,
            (true, true) => State::Both,
        }
    }

    /// Creates the outbound channel, replacing any previous one.
    ///
    /// Receives pending on the replaced channel are abandoned.
    pub fn outbound(&mut self, port: u16) -> Result<&mut Self, CommunicatorError> {
        let sender = Sender::new(
            self.policy.as_ref(),
            port,
            self.context.clone(),
            self.codec.clone(),
        )?;
        if self.outbound.replace(sender).is_some() {
            tracing::debug!(port, "replaced outbound channel");
        }
        Ok(self)
    }

    /// Creates the inbound channel, replacing any previous one.
    ///
    /// A handler installed with [`process`](Self::process) on the replaced
    /// channel stops.
    pub fn inbound(&mut self, port: u16) -> Result<&mut Self, CommunicatorError> {
        let receiver = Receiver::new(
            self.policy.as_ref(),
            port,
            self.context.clone(),
            self.codec.clone(),
        )?;
        if self.inbound.replace(receiver).is_some() {
            tracing::debug!(port, "replaced inbound channel");
        }
        Ok(self)
    }

    /// Sends `payload` to the outbound destination without waiting for
    /// delivery.
    ///
    /// Does nothing if there is no outbound channel.
    pub fn distribute<T: Serialize + ?Sized>(
        &mut self,
        payload: &T,
    ) -> Result<&mut Self, CommunicatorError> {
        match &self.outbound {
            Some(outbound) => outbound.send(payload)?,
            None => tracing::debug!("distribute without outbound channel"),
        }
        Ok(self)
    }

    /// Answers every request arriving on the inbound channel.
    ///
    /// Each datagram is decoded as `T` and passed to `handler` together with
    /// its source. The handler's return value is sent back to that source.
    /// Datagrams that do not decode are skipped and reported as
    /// [`TransportEvent::DecodeFailed`].
    ///
    /// Requests are handled on the runtime's worker threads in the background,
    /// use [`dispatch`](Self::dispatch) to block the current thread while
    /// serving. Does nothing if there is no inbound channel.
    pub fn process<T, R, F>(&mut self, mut handler: F) -> &mut Self
    where
        T: DeserializeOwned,
        R: Serialize,
        F: FnMut(SocketAddr, T) -> R + Send + 'static,
    {
        let Some(inbound) = self.inbound.as_mut() else {
            tracing::debug!("process without inbound channel");
            return self;
        };

        let replier = inbound.replier();
        let codec = self.codec.clone();
        let events = self.context.events().clone();
        inbound.receive(move |source, payload| {
            let request = match codec.decode::<T>(&payload) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(%source, %err, "dropping malformed request");
                    events.emit(TransportEvent::DecodeFailed {
                        source: Some(source),
                        message: err.to_string(),
                    });
                    return;
                }
            };

            let response = handler(source, request);
            if let Err(err) = replier.reply(&response, source) {
                tracing::warn!(%source, %err, "failed to encode response");
                events.emit(TransportEvent::EncodeFailed {
                    destination: source,
                    message: err.to_string(),
                });
            }
        });
        self
    }

    /// Collects replies on the outbound channel for `timeout`.
    ///
    /// Each reply is decoded as `T` and passed to `handler`; replies that do
    /// not decode are skipped and reported as
    /// [`TransportEvent::DecodeFailed`]. This always blocks for the full
    /// `timeout`. Only this collection ends when the time is up, handlers
    /// installed with [`process`](Self::process) keep running.
    ///
    /// Returns the number of replies passed to `handler`. Returns 0
    /// immediately if there is no outbound channel.
    pub fn collect<T, F>(&mut self, timeout: Duration, mut handler: F) -> usize
    where
        T: DeserializeOwned,
        F: FnMut(T),
    {
        let Some(outbound) = self.outbound.as_mut() else {
            tracing::debug!("collect without outbound channel");
            return 0;
        };

        let codec = &self.codec;
        let events = self.context.events();
        let mut collected = 0;
        let collection = outbound.receive_from_for(timeout, |source, payload| {
            match codec.decode::<T>(&payload) {
                Ok(value) => {
                    collected += 1;
                    handler(value);
                }
                Err(err) => {
                    tracing::warn!(%source, %err, "dropping malformed reply");
                    events.emit(TransportEvent::DecodeFailed {
                        source: Some(source),
                        message: err.to_string(),
                    });
                }
            }
        });
        self.runtime.block_on(collection);

        tracing::debug!(collected, ?timeout, "collection window closed");
        collected
    }

    /// Blocks the current thread while the runtime serves the inbound channel.
    ///
    /// Returns only after the [`shutdown_token`](Self::shutdown_token) has been
    /// cancelled.
    pub fn dispatch(&self) {
        tracing::debug!(state = ?self.state(), "dispatching");
        self.runtime.block_on(self.shutdown.cancelled());
        tracing::debug!("dispatch stopped");
    }

    /// Token that makes [`dispatch`](Self::dispatch) return when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Receiving side of the transport event channel.
    pub fn events(&self) -> crossbeam::channel::Receiver<TransportEvent> {
        self.events.clone()
    }

    /// The inbound channel, for handling raw datagrams.
    pub fn inbound_channel(&mut self) -> Option<&mut Receiver<C>> {
        self.inbound.as_mut()
    }

    /// The outbound channel, for sending and receiving raw datagrams.
    pub fn outbound_channel(&mut self) -> Option<&mut Sender<C>> {
        self.outbound.as_mut()
    }

    pub fn inbound_addr(&self) -> Option<SocketAddr> {
        self.inbound
            .as_ref()
            .and_then(|inbound| inbound.local_addr().ok())
    }

    pub fn outbound_addr(&self) -> Option<SocketAddr> {
        self.outbound
            .as_ref()
            .and_then(|outbound| outbound.local_addr().ok())
    }

    pub fn outbound_destination(&self) -> Option<SocketAddr> {
        self.outbound.as_ref().map(Sender::destination)
    }
}
