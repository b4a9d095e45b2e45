//! Gateways accept connections and turn each into a [`Channel`].
//!
//! A gateway listens on a TCP or UDP endpoint, or stays passive and has connections handed to
//! it with [`Gateway::accept`]. Every connection must open with a handshake. Without a reconnect
//! token, the gateway's initial-binding factory seeds the new channel. With one, the bindings
//! captured by the token are restored under their original ids. A gateway configured with
//! [`GatewayConfig::token_required`] accepts only the latter, which is how a client moves to a
//! secondary gateway without going through its entry logic again.
//!
//! # Example
//!
//! ```no_run
//! use kameo_gateway::{
//!     binding::BindingSpec, capability::CapabilityCatalog, BindingFlags, Capability,
//!     GatewayBuilder, GatewayConfig,
//! };
//! # use kameo_gateway::{message::{Call, Context}, Actor};
//! # struct Entry;
//! # impl Actor for Entry {
//! #     async fn handle(&mut self, _: Call, _: Context) -> anyhow::Result<bytes::Bytes> {
//! #         Ok(bytes::Bytes::new())
//! #     }
//! # }
//!
//! const IENTRY: Capability = Capability::from_static("IEntry");
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = CapabilityCatalog::builder()
//!     .register(IENTRY, ["GetGreeter"])
//!     .build()?;
//!
//! let gateway = GatewayBuilder::new(GatewayConfig::tcp("127.0.0.1:5001".parse()?))
//!     .catalog(catalog)
//!     .initial_bindings(|_channel, _info| {
//!         let entry = kameo_gateway::spawn(Entry);
//!         Ok(vec![BindingSpec::new(entry, IENTRY).with_flags(BindingFlags::STOP_ON_CLOSE)])
//!     })
//!     .start()
//!     .await?;
//!
//! // ...
//!
//! gateway.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    binding::{BindingRegistry, BindingSpec},
    capability::CapabilityCatalog,
    channel::{Channel, ChannelContext, ChannelId, DEFAULT_OUTBOUND_CAPACITY},
    codec::{MsgPackCodec, PacketCodec, SharedCodec},
    error::{BoxError, ChannelError, GatewayError, HandshakeError, TokenError},
    event::EventBus,
    framing::{self, DEFAULT_MAX_FRAME_SIZE},
    packet::{Handshake, HandshakeAck, HandshakeReject, Packet},
    session::{ReconnectToken, SessionStore, DEFAULT_TOKEN_TTL},
    transport::{
        tcp,
        udp::{UdpListener, MAX_DATAGRAM_SIZE},
        Connection, FrameSink, FrameSource, TransportKind,
    },
};

/// Default time a new connection has to complete its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time [`Gateway::stop`] waits for in-flight requests on each channel.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Endpoint to listen on. `None` makes the gateway passive: connections are handed to it
    /// with [`Gateway::accept`].
    pub listen_addr: Option<SocketAddr>,
    /// Endpoint advertised to clients being moved to this gateway.
    ///
    /// Falls back to the bound local address.
    pub connect_addr: Option<SocketAddr>,
    /// The transport to listen with.
    pub transport: TransportKind,
    /// Accept only connections presenting a valid reconnect token.
    pub token_required: bool,
    /// Time a new connection has to send its handshake.
    pub handshake_timeout: Duration,
    /// Time [`Gateway::stop`] waits for in-flight requests before closing channels forcibly.
    pub shutdown_timeout: Duration,
    /// Time to live of reconnect tokens minted for this gateway.
    pub token_ttl: Duration,
    /// Close channels which receive nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// Largest frame accepted from a peer.
    pub max_frame_size: usize,
    /// Capacity of each channel's outbound queue, in packets.
    pub outbound_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_addr: None,
            connect_addr: None,
            transport: TransportKind::Tcp,
            token_required: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            token_ttl: DEFAULT_TOKEN_TTL,
            idle_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl GatewayConfig {
    /// A gateway listening for TCP connections.
    pub fn tcp(listen_addr: SocketAddr) -> Self {
        GatewayConfig {
            listen_addr: Some(listen_addr),
            transport: TransportKind::Tcp,
            ..Default::default()
        }
    }

    /// A gateway listening for UDP datagrams.
    pub fn udp(listen_addr: SocketAddr) -> Self {
        GatewayConfig {
            listen_addr: Some(listen_addr),
            transport: TransportKind::Udp,
            max_frame_size: MAX_DATAGRAM_SIZE,
            ..Default::default()
        }
    }

    /// A gateway which does not listen, and only accepts connections handed to it.
    pub fn passive() -> Self {
        GatewayConfig::default()
    }

    /// Sets whether connections must present a reconnect token.
    pub fn with_token_required(mut self, token_required: bool) -> Self {
        self.token_required = token_required;
        self
    }

    /// Sets the endpoint advertised to clients.
    pub fn with_connect_addr(mut self, connect_addr: SocketAddr) -> Self {
        self.connect_addr = Some(connect_addr);
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the time to live of reconnect tokens.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the largest accepted frame size.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Sets the capacity of each channel's outbound queue.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }
}

/// Describes a connection to the initial-binding factory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The address of the client.
    pub remote_addr: SocketAddr,
    /// The local address the connection arrived on.
    pub local_addr: SocketAddr,
    /// The transport of the connection.
    pub transport: TransportKind,
}

/// Produces the bindings of a new channel.
///
/// Called once per connection without a reconnect token, before any request is dispatched.
/// An error rejects the connection.
pub type InitialBindingsFn =
    dyn Fn(&Channel, &ConnectionInfo) -> Result<Vec<BindingSpec>, BoxError> + Send + Sync;

/// Assembles and starts a [`Gateway`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    codec: SharedCodec,
    catalog: Option<Arc<CapabilityCatalog>>,
    sessions: SessionStore,
    events: EventBus,
    initial_bindings: Option<Arc<InitialBindingsFn>>,
}

impl GatewayBuilder {
    /// Creates a builder with the default codec, a fresh session store and event bus.
    pub fn new(config: GatewayConfig) -> Self {
        GatewayBuilder {
            config,
            codec: Arc::new(MsgPackCodec),
            catalog: None,
            sessions: SessionStore::new(),
            events: EventBus::new(),
            initial_bindings: None,
        }
    }

    /// Sets the packet codec.
    pub fn codec(mut self, codec: impl PacketCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Sets the codec shared with other gateways.
    pub fn shared_codec(mut self, codec: SharedCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the capabilities bindings may expose.
    pub fn catalog(mut self, catalog: impl Into<Arc<CapabilityCatalog>>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Sets the session store. Gateways sharing a store accept each other's tokens.
    pub fn sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = sessions;
        self
    }

    /// Sets the event bus. Gateways sharing a bus deliver each other's actor events.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Sets the initial-binding factory.
    pub fn initial_bindings<F>(mut self, f: F) -> Self
    where
        F: Fn(&Channel, &ConnectionInfo) -> Result<Vec<BindingSpec>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.initial_bindings = Some(Arc::new(f));
        self
    }

    /// Binds the listen endpoint and starts accepting connections.
    ///
    /// Resolves once the gateway is ready for clients.
    pub async fn start(self) -> Result<Gateway, GatewayError> {
        let catalog = self
            .catalog
            .ok_or_else(|| GatewayError::Config("a capability catalog is required".to_string()))?;
        if !self.config.token_required && self.initial_bindings.is_none() {
            return Err(GatewayError::Config(
                "an initial-binding factory is required unless tokens are required".to_string(),
            ));
        }

        let listener = match self.config.listen_addr {
            Some(addr) => Some(bind(addr, &self.config).await?),
            None => None,
        };
        let local_addr = listener.as_ref().map(Listener::local_addr);

        let context = ChannelContext {
            catalog,
            codec: self.codec,
            sessions: self.sessions,
            events: self.events,
            token_ttl: self.config.token_ttl,
            outbound_capacity: self.config.outbound_capacity,
            max_frame_size: self.config.max_frame_size,
        };
        let gateway = Gateway {
            inner: Arc::new(GatewayInner {
                config: self.config,
                local_addr,
                context,
                initial_bindings: self.initial_bindings,
                channels: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                handshakes: TaskTracker::new(),
                accept_task: Mutex::new(None),
            }),
        };

        match listener {
            Some(listener) => {
                let task = tokio::spawn(accept_loop(
                    Arc::downgrade(&gateway.inner),
                    listener,
                    gateway.inner.shutdown.clone(),
                ));
                *gateway.inner.accept_task.lock() = Some(task);
                info!(
                    local_addr = ?local_addr,
                    transport = %gateway.inner.config.transport,
                    token_required = gateway.inner.config.token_required,
                    "gateway started"
                );
            }
            None => info!(
                token_required = gateway.inner.config.token_required,
                "passive gateway started"
            ),
        }

        Ok(gateway)
    }
}

impl fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("catalog", &self.catalog)
            .field("initial_bindings", &self.initial_bindings.is_some())
            .finish()
    }
}

/// Accepts connections and tracks the channels created for them.
///
/// `Gateway` is a cheap, clonable handle.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    local_addr: Option<SocketAddr>,
    context: ChannelContext,
    initial_bindings: Option<Arc<InitialBindingsFn>>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    handshakes: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Creates a builder for a gateway.
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// The address the gateway is listening on, or `None` if it is passive.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// The address clients should connect to.
    pub fn connect_addr(&self) -> Option<SocketAddr> {
        self.inner.config.connect_addr.or(self.inner.local_addr)
    }

    /// The gateway's configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// The capabilities bindings may expose.
    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.inner.context.catalog
    }

    /// Where the gateway's reconnect tokens are kept.
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.context.sessions
    }

    /// The event bus shared by the gateway's channels.
    pub fn events(&self) -> &EventBus {
        &self.inner.context.events
    }

    /// Every live channel, ordered by id.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.inner.channels.lock().values().cloned().collect();
        channels.sort_by_key(Channel::id);
        channels
    }

    /// Returns a live channel by id.
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.inner.channels.lock().get(&id).cloned()
    }

    /// The number of live channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Returns `true` once [`Gateway::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Mints a token which opens a channel on this gateway with the given bindings.
    ///
    /// The bindings receive ids starting at 1, in order.
    pub fn issue_token(&self, bindings: Vec<BindingSpec>) -> Result<ReconnectToken, ChannelError> {
        let catalog = &self.inner.context.catalog;
        let registry = BindingRegistry::new();
        for spec in bindings {
            if let Some(unknown) = spec
                .capabilities
                .iter()
                .find(|capability| !catalog.contains(capability))
            {
                return Err(ChannelError::UnknownCapability(unknown.clone()));
            }
            registry.insert(spec)?;
        }

        let token = self.inner.context.sessions.issue(
            registry.snapshot(),
            None,
            self.inner.config.token_ttl,
        );
        debug!(bindings = registry.len(), "reconnect token issued");
        Ok(token)
    }

    /// Runs the handshake on a connection and starts a channel for it.
    ///
    /// On failure the peer is sent a rejection, the connection is closed and no channel is
    /// created.
    pub async fn accept(&self, connection: Connection) -> Result<Channel, HandshakeError> {
        let info = ConnectionInfo {
            remote_addr: connection.remote_addr(),
            local_addr: connection.local_addr(),
            transport: connection.kind(),
        };
        let (mut source, mut sink) = connection.split();

        match self.handshake(&mut *source, &mut *sink, &info).await {
            Ok(channel) => {
                channel.attach(source, sink, self.inner.config.idle_timeout);
                info!(
                    channel_id = %channel.id(),
                    remote_addr = %info.remote_addr,
                    transport = %info.transport,
                    bindings = channel.binding_count(),
                    "channel opened"
                );
                Ok(channel)
            }
            Err(err) => {
                warn!(remote_addr = %info.remote_addr, %err, "handshake failed");
                self.reject(&mut *sink, &err).await;
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        info: &ConnectionInfo,
    ) -> Result<Channel, HandshakeError> {
        if self.is_stopped() {
            return Err(HandshakeError::GatewayStopped);
        }

        let frame = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(HandshakeError::GatewayStopped),
            frame = tokio::time::timeout(self.inner.config.handshake_timeout, source.recv_frame()) => {
                frame.map_err(|_| HandshakeError::Timeout)??
            }
        };
        let frame = frame.ok_or(HandshakeError::ConnectionClosed)?;
        let handshake = match framing::decode_frame(&*self.inner.context.codec, &frame)? {
            Packet::Handshake(handshake) => handshake,
            other => return Err(HandshakeError::UnexpectedPacket(other.kind())),
        };

        let channel = self.establish(handshake, info)?;
        self.register(&channel);
        if self.is_stopped() {
            channel.close();
            return Err(HandshakeError::GatewayStopped);
        }

        let ack = Packet::HandshakeAck(HandshakeAck {
            channel_id: channel.id(),
            bindings: channel.bindings(),
        });
        let sent = match framing::encode_frame(&*self.inner.context.codec, &ack) {
            Ok(frame) => sink.send_frame(frame).await.map_err(HandshakeError::from),
            Err(err) => Err(HandshakeError::from(err)),
        };
        if let Err(err) = sent {
            channel.close();
            return Err(err);
        }

        Ok(channel)
    }

    /// Creates the channel and installs its bindings.
    fn establish(
        &self,
        handshake: Handshake,
        info: &ConnectionInfo,
    ) -> Result<Channel, HandshakeError> {
        let context = &self.inner.context;
        let session = match handshake.token {
            Some(token) => Some(context.sessions.redeem(&token)?),
            None if self.inner.config.token_required => return Err(TokenError::Missing.into()),
            None => None,
        };

        let channel = Channel::new(context.clone(), info.remote_addr, info.transport);
        let installed = match session {
            Some(session) => {
                debug!(channel_id = %channel.id(), origin = ?session.origin, "resuming session");
                session
                    .bindings
                    .into_iter()
                    .try_for_each(|binding| channel.restore(binding).map(|_| ()))
                    .map_err(|err| HandshakeError::InitialBindings(Box::new(err)))
            }
            None => self.seed(&channel, info),
        };
        if let Err(err) = installed {
            channel.close();
            return Err(err);
        }

        Ok(channel)
    }

    fn seed(&self, channel: &Channel, info: &ConnectionInfo) -> Result<(), HandshakeError> {
        let Some(factory) = &self.inner.initial_bindings else {
            return Ok(());
        };

        let specs = factory(channel, info).map_err(HandshakeError::InitialBindings)?;
        for spec in specs {
            channel
                .bind_spec(spec)
                .map_err(|err| HandshakeError::InitialBindings(Box::new(err)))?;
        }

        Ok(())
    }

    fn register(&self, channel: &Channel) {
        self.inner
            .channels
            .lock()
            .insert(channel.id(), channel.clone());

        let gateway = Arc::downgrade(&self.inner);
        channel.on_close(move |id| {
            if let Some(inner) = gateway.upgrade() {
                inner.channels.lock().remove(&id);
            }
        });
    }

    async fn reject(&self, sink: &mut dyn FrameSink, err: &HandshakeError) {
        let reject = Packet::HandshakeReject(HandshakeReject {
            reason: err.to_string(),
        });
        if let Ok(frame) = framing::encode_frame(&*self.inner.context.codec, &reject) {
            if let Err(err) = sink.send_frame(frame).await {
                trace!(%err, "failed to send handshake rejection");
            }
        }
        if let Err(err) = sink.shutdown().await {
            trace!(%err, "failed to shut down rejected connection");
        }
    }

    /// Stops accepting connections and closes every channel.
    ///
    /// Each channel gets up to [`GatewayConfig::shutdown_timeout`] to answer its in-flight
    /// requests before it is closed forcibly. Channels which had to be closed forcibly are
    /// reported in [`GatewayError::ShutdownTimedOut`]; they are closed all the same.
    ///
    /// Stopping an already stopped gateway does nothing.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(local_addr = ?self.inner.local_addr, "gateway stopping");
        self.inner.shutdown.cancel();
        let accept_task = self.inner.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(err) = task.await {
                error!(%err, "accept loop failed");
            }
        }
        self.inner.handshakes.close();
        self.inner.handshakes.wait().await;

        let channels: Vec<Channel> = self.inner.channels.lock().values().cloned().collect();
        let timeout = self.inner.config.shutdown_timeout;
        let drained = join_all(channels.iter().map(|channel| async move {
            (channel.id(), channel.drain_and_close(timeout).await)
        }))
        .await;
        self.inner.channels.lock().clear();

        let timed_out: Vec<ChannelId> = drained
            .into_iter()
            .filter_map(|(id, drained)| (!drained).then_some(id))
            .collect();
        if !timed_out.is_empty() {
            warn!(channels = ?timed_out, "channels closed before their requests drained");
            return Err(GatewayError::ShutdownTimedOut {
                channels: timed_out,
            });
        }

        info!(local_addr = ?self.inner.local_addr, "gateway stopped");
        Ok(())
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("local_addr", &self.inner.local_addr)
            .field("transport", &self.inner.config.transport)
            .field("token_required", &self.inner.config.token_required)
            .field("channels", &self.channel_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

enum Listener {
    Tcp {
        listener: TcpListener,
        local_addr: SocketAddr,
        max_frame_size: usize,
    },
    Udp(UdpListener),
}

impl Listener {
    fn local_addr(&self) -> SocketAddr {
        match self {
            Listener::Tcp { local_addr, .. } => *local_addr,
            Listener::Udp(listener) => listener.local_addr(),
        }
    }

    /// Returns `None` once the listener can accept no more connections.
    async fn accept(&mut self) -> Option<io::Result<Connection>> {
        match self {
            Listener::Tcp {
                listener,
                max_frame_size,
                ..
            } => Some(
                listener
                    .accept()
                    .await
                    .and_then(|(stream, _)| tcp::connection(stream, *max_frame_size)),
            ),
            Listener::Udp(listener) => listener.accept().await.ok().map(Ok),
        }
    }
}

async fn bind(addr: SocketAddr, config: &GatewayConfig) -> Result<Listener, GatewayError> {
    let bind_err = |source| GatewayError::Bind {
        addr,
        transport: config.transport,
        source,
    };
    match config.transport {
        TransportKind::Tcp => {
            let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
            let local_addr = listener.local_addr().map_err(bind_err)?;
            Ok(Listener::Tcp {
                listener,
                local_addr,
                max_frame_size: config.max_frame_size,
            })
        }
        TransportKind::Udp => {
            let listener = UdpListener::bind(addr, config.max_frame_size)
                .await
                .map_err(bind_err)?;
            Ok(Listener::Udp(listener))
        }
        TransportKind::Memory => Err(GatewayError::Config(
            "the memory transport cannot listen; use a passive gateway".to_string(),
        )),
    }
}

async fn accept_loop(
    gateway: Weak<GatewayInner>,
    mut listener: Listener,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let connection = match accepted {
            Some(Ok(connection)) => connection,
            Some(Err(err)) => {
                error!(%err, "failed to accept connection");
                continue;
            }
            None => break,
        };
        let Some(inner) = gateway.upgrade() else {
            break;
        };

        trace!(remote_addr = %connection.remote_addr(), "accepted connection");
        let gateway = Gateway { inner };
        gateway.inner.handshakes.clone().spawn(async move {
            let _ = gateway.accept(connection).await;
        });
    }

    trace!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        actor::{spawn, Actor},
        binding::{BindingFlags, BindingId},
        capability::Capability,
        codec::MsgPackCodec,
        framing::{decode_frame, encode_frame},
        message::{Call, Context},
        transport::memory,
    };

    use super::*;

    const IENTRY: Capability = Capability::from_static("IEntry");

    struct Entry;

    impl Actor for Entry {
        async fn handle(&mut self, _call: Call, _ctx: Context) -> anyhow::Result<Bytes> {
            Ok(Bytes::new())
        }
    }

    fn catalog() -> CapabilityCatalog {
        CapabilityCatalog::builder()
            .register(IENTRY, ["Ping"])
            .build()
            .unwrap()
    }

    async fn passive(token_required: bool) -> Gateway {
        let config = GatewayConfig::passive()
            .with_token_required(token_required)
            .with_handshake_timeout(Duration::from_millis(200));
        GatewayBuilder::new(config)
            .catalog(catalog())
            .initial_bindings(|_, _| {
                Ok(vec![
                    BindingSpec::new(spawn(Entry), IENTRY).with_flags(BindingFlags::STOP_ON_CLOSE)
                ])
            })
            .start()
            .await
            .unwrap()
    }

    fn pair() -> (Connection, Connection) {
        memory::pair(
            SocketAddr::from(([127, 0, 0, 1], 5001)),
            SocketAddr::from(([127, 0, 0, 1], 40000)),
        )
    }

    async fn send_handshake(client: &mut Connection, token: Option<ReconnectToken>) {
        let frame = encode_frame(&MsgPackCodec, &Packet::Handshake(Handshake { token })).unwrap();
        client.send_frame(frame).await.unwrap();
    }

    async fn recv_packet(client: &mut Connection) -> Packet {
        let frame = client.recv_frame().await.unwrap().unwrap();
        decode_frame(&MsgPackCodec, &frame).unwrap()
    }

    #[tokio::test]
    async fn handshake_runs_the_initial_binding_factory() {
        let gateway = passive(false).await;
        let (server, mut client) = pair();

        send_handshake(&mut client, None).await;
        let channel = gateway.accept(server).await.unwrap();

        match recv_packet(&mut client).await {
            Packet::HandshakeAck(ack) => {
                assert_eq!(ack.channel_id, channel.id());
                assert_eq!(ack.bindings.len(), 1);
                assert_eq!(ack.bindings[0].binding_id, BindingId::new(1));
                assert!(ack.bindings[0].capabilities.contains(&IENTRY));
            }
            other => panic!("expected an ack, got {other:?}"),
        }
        assert_eq!(gateway.channel_count(), 1);
        assert_eq!(gateway.channel(channel.id()).map(|c| c.id()), Some(channel.id()));
    }

    #[tokio::test]
    async fn token_required_gateway_rejects_missing_tokens() {
        let gateway = passive(true).await;
        let (server, mut client) = pair();

        send_handshake(&mut client, None).await;
        let err = gateway.accept(server).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::InvalidToken(TokenError::Missing)
        ));
        assert!(matches!(
            recv_packet(&mut client).await,
            Packet::HandshakeReject(_)
        ));
        assert_eq!(client.recv_frame().await.unwrap(), None);
        assert_eq!(gateway.channel_count(), 0);
    }

    #[tokio::test]
    async fn unknown_tokens_are_rejected() {
        let gateway = passive(true).await;
        let (server, mut client) = pair();

        send_handshake(&mut client, Some(ReconnectToken::generate())).await;
        let err = gateway.accept(server).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::InvalidToken(TokenError::Unknown)
        ));
        assert_eq!(gateway.channel_count(), 0);
    }

    #[tokio::test]
    async fn issued_tokens_restore_bindings() {
        let gateway = passive(true).await;
        let actor = spawn(Entry);
        let token = gateway
            .issue_token(vec![BindingSpec::new(actor.clone(), IENTRY)])
            .unwrap();

        let (server, mut client) = pair();
        send_handshake(&mut client, Some(token)).await;
        let channel = gateway.accept(server).await.unwrap();

        assert!(matches!(recv_packet(&mut client).await, Packet::HandshakeAck(_)));
        let binding = channel.binding(BindingId::new(1)).unwrap();
        assert_eq!(binding.actor, actor);

        // single use
        let (server, mut client) = pair();
        send_handshake(&mut client, Some(token)).await;
        assert!(gateway.accept(server).await.is_err());
    }

    #[tokio::test]
    async fn issue_token_checks_capabilities() {
        let gateway = passive(true).await;
        let err = gateway
            .issue_token(vec![BindingSpec::new(
                spawn(Entry),
                Capability::from_static("IMissing"),
            )])
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownCapability(_)));
    }

    #[tokio::test]
    async fn silent_connections_time_out() {
        let gateway = passive(false).await;
        let (server, _client) = pair();

        let err = gateway.accept(server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
        assert_eq!(gateway.channel_count(), 0);
    }

    #[tokio::test]
    async fn first_frame_must_be_a_handshake() {
        let gateway = passive(false).await;
        let (server, mut client) = pair();

        let frame = encode_frame(
            &MsgPackCodec,
            &Packet::HandshakeReject(HandshakeReject {
                reason: "nope".to_string(),
            }),
        )
        .unwrap();
        client.send_frame(frame).await.unwrap();

        let err = gateway.accept(server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedPacket(_)));
    }

    #[tokio::test]
    async fn closed_channels_leave_the_live_set() {
        let gateway = passive(false).await;
        let (server, mut client) = pair();
        send_handshake(&mut client, None).await;
        let channel = gateway.accept(server).await.unwrap();

        channel.close();
        assert_eq!(gateway.channel_count(), 0);
    }

    #[tokio::test]
    async fn stop_closes_channels_and_is_idempotent() {
        let gateway = passive(false).await;
        let (server, mut client) = pair();
        send_handshake(&mut client, None).await;
        let channel = gateway.accept(server).await.unwrap();

        gateway.stop().await.unwrap();
        assert!(channel.is_closed());
        assert!(gateway.is_stopped());
        assert_eq!(gateway.channel_count(), 0);
        gateway.stop().await.unwrap();

        let (server, mut client) = pair();
        send_handshake(&mut client, None).await;
        assert!(matches!(
            gateway.accept(server).await,
            Err(HandshakeError::GatewayStopped)
        ));
    }

    #[tokio::test]
    async fn start_requires_a_factory_unless_tokens_are_required() {
        let err = GatewayBuilder::new(GatewayConfig::passive())
            .catalog(catalog())
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));

        assert!(GatewayBuilder::new(GatewayConfig::passive().with_token_required(true))
            .catalog(catalog())
            .start()
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn start_reports_bind_errors() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = GatewayBuilder::new(GatewayConfig::tcp(addr).with_token_required(true))
            .catalog(catalog())
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Bind { .. }));
    }

    #[tokio::test]
    async fn connect_addr_falls_back_to_local_addr() {
        let gateway = GatewayBuilder::new(
            GatewayConfig::tcp(SocketAddr::from(([127, 0, 0, 1], 0))).with_token_required(true),
        )
        .catalog(catalog())
        .start()
        .await
        .unwrap();

        let local_addr = gateway.local_addr().unwrap();
        assert_ne!(local_addr.port(), 0);
        assert_eq!(gateway.connect_addr(), Some(local_addr));
        gateway.stop().await.unwrap();
    }
}
