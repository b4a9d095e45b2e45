//! The client end of a channel.
//!
//! [`ChannelClient`] dials a gateway, completes the handshake and then multiplexes requests,
//! one-way calls and pushed events over the connection. Requests are matched to their replies
//! by correlation id, so any number may be in flight at once and they may complete in any
//! order.
//!
//! ```no_run
//! use kameo_gateway::{client::ClientOptions, Capability, ChannelClient};
//!
//! const IENTRY: Capability = Capability::from_static("IEntry");
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ChannelClient::connect_tcp("127.0.0.1:5001", ClientOptions::default()).await?;
//! let entry = client.binding_for(&IENTRY).expect("entry binding");
//! let count: i64 = client.bound(entry, IENTRY).ask("GetCount", &()).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    net::ToSocketAddrs,
    sync::{mpsc, oneshot},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    binding::{BindingId, BindingInfo},
    capability::Capability,
    channel::ChannelId,
    codec::{self, MsgPackCodec, SharedCodec},
    error::{ClientError, Fault, HandshakeError},
    framing::{self, DEFAULT_MAX_FRAME_SIZE},
    gateway::DEFAULT_HANDSHAKE_TIMEOUT,
    observer::SubscriberToken,
    packet::{CorrelationId, Handshake, HandshakeAck, Packet, Request},
    session::ReconnectToken,
    transport::{tcp, udp, Connection, FrameSink, FrameSource},
};

/// Default time a request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of pushed events buffered until they are read from [`ChannelClient::events`].
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

const OUTBOUND_CAPACITY: usize = 256;

/// Events pushed by the gateway, tagged with the subscriber token they were subscribed under.
pub type EventStream = ReceiverStream<(SubscriberToken, Bytes)>;

type PendingRequests = Mutex<HashMap<CorrelationId, oneshot::Sender<Result<Bytes, Fault>>>>;

/// Options for connecting a [`ChannelClient`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// A reconnect token to present in the handshake.
    pub token: Option<ReconnectToken>,
    /// The packet codec. Must match the gateway's.
    pub codec: SharedCodec,
    /// Time to wait for the gateway to answer the handshake.
    pub handshake_timeout: Duration,
    /// Time each request waits for its reply.
    pub request_timeout: Duration,
    /// Largest frame accepted from the gateway.
    pub max_frame_size: usize,
    /// Events buffered while nobody reads them. Further events are dropped.
    pub event_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            token: None,
            codec: Arc::new(MsgPackCodec),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientOptions {
    /// Presents a reconnect token in the handshake.
    pub fn with_token(mut self, token: ReconnectToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how many unread events are buffered.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// A connection to a gateway.
///
/// `ChannelClient` is a cheap, clonable handle. The connection closes when [`close`] is called
/// or the gateway closes the channel.
///
/// [`close`]: ChannelClient::close
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    channel_id: ChannelId,
    bindings: Vec<BindingInfo>,
    outbound: mpsc::Sender<Packet>,
    pending: PendingRequests,
    next_correlation_id: AtomicU32,
    events: Mutex<Option<mpsc::Receiver<(SubscriberToken, Bytes)>>>,
    request_timeout: Duration,
    closed: CancellationToken,
}

impl ChannelClient {
    /// Connects to a TCP gateway.
    pub async fn connect_tcp(
        addr: impl ToSocketAddrs,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let connection = tcp::connect(addr, options.max_frame_size).await?;
        Self::connect(connection, options).await
    }

    /// Connects to a UDP gateway.
    pub async fn connect_udp(addr: SocketAddr, options: ClientOptions) -> Result<Self, ClientError> {
        let connection = udp::connect(addr).await?;
        Self::connect(connection, options).await
    }

    /// Completes the handshake on an established connection.
    pub async fn connect(
        connection: Connection,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let remote_addr = connection.remote_addr();
        let (mut source, mut sink) = connection.split();

        let handshake = Packet::Handshake(Handshake {
            token: options.token,
        });
        sink.send_frame(framing::encode_frame(&*options.codec, &handshake)?)
            .await?;
        let ack = match tokio::time::timeout(options.handshake_timeout, source.recv_frame()).await
        {
            Ok(frame) => read_ack(&options, frame?)?,
            Err(_) => return Err(HandshakeError::Timeout.into()),
        };
        debug!(
            channel_id = %ack.channel_id,
            %remote_addr,
            bindings = ack.bindings.len(),
            "channel established"
        );

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(options.event_capacity.max(1));
        let inner = Arc::new(ClientInner {
            channel_id: ack.channel_id,
            bindings: ack.bindings,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_correlation_id: AtomicU32::new(1),
            events: Mutex::new(Some(events_rx)),
            request_timeout: options.request_timeout,
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            outbound_rx,
            sink,
            options.codec.clone(),
            inner.closed.clone(),
        ));
        tokio::spawn(read_loop(inner.clone(), source, options.codec, events_tx));

        Ok(ChannelClient { inner })
    }

    /// The id the gateway assigned to the channel.
    pub fn channel_id(&self) -> ChannelId {
        self.inner.channel_id
    }

    /// The bindings installed when the channel was established.
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.inner.bindings
    }

    /// Returns the first initial binding exposing a capability.
    pub fn binding_for(&self, capability: &Capability) -> Option<BindingId> {
        self.inner
            .bindings
            .iter()
            .find(|info| info.capabilities.contains(capability))
            .map(|info| info.binding_id)
    }

    /// Sends a request and waits for its reply.
    pub async fn request(
        &self,
        binding_id: BindingId,
        capability: Capability,
        method: impl Into<String>,
        args: Bytes,
    ) -> Result<Bytes, ClientError> {
        let correlation_id = self.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(correlation_id, tx);
        if self.is_closed() {
            self.inner.pending.lock().remove(&correlation_id);
            return Err(ClientError::Closed);
        }

        let packet = Packet::Request {
            correlation_id,
            request: Request {
                binding_id,
                capability,
                method: method.into(),
                args,
            },
        };
        if self.inner.outbound.send(packet).await.is_err() {
            self.inner.pending.lock().remove(&correlation_id);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(fault))) => Err(ClientError::Fault(fault)),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&correlation_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends a one-way call.
    ///
    /// Resolves once the call is queued for sending. Failures on the gateway side are not
    /// reported.
    pub async fn notify(
        &self,
        binding_id: BindingId,
        capability: Capability,
        method: impl Into<String>,
        args: Bytes,
    ) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let packet = Packet::OneWay(Request {
            binding_id,
            capability,
            method: method.into(),
            args,
        });
        self.inner
            .outbound
            .send(packet)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Returns a handle for calling one binding under one capability.
    pub fn bound(&self, binding_id: BindingId, capability: Capability) -> BoundRef {
        BoundRef {
            client: self.clone(),
            binding_id,
            capability,
        }
    }

    /// Takes the stream of pushed events.
    ///
    /// Up to [`ClientOptions::event_capacity`] events are buffered until they are read; later
    /// ones are dropped. Returns `None` if the stream was already taken.
    pub fn events(&self) -> Option<EventStream> {
        self.inner
            .events
            .lock()
            .take()
            .map(ReceiverStream::new)
    }

    /// Returns `true` once the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Waits for the connection to close.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Closes the connection. Pending requests resolve with [`ClientError::Closed`].
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    fn next_correlation_id(&self) -> CorrelationId {
        loop {
            let id = self.inner.next_correlation_id.fetch_add(1, Ordering::Relaxed);
            // 0 marks uncorrelated packets
            if id != 0 {
                return id;
            }
        }
    }
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("channel_id", &self.inner.channel_id)
            .field("bindings", &self.inner.bindings)
            .field("pending", &self.inner.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Calls one binding under one capability, encoding arguments with the default payload
/// encoding.
#[derive(Clone, Debug)]
pub struct BoundRef {
    client: ChannelClient,
    binding_id: BindingId,
    capability: Capability,
}

impl BoundRef {
    /// The binding being called.
    pub fn binding_id(&self) -> BindingId {
        self.binding_id
    }

    /// Calls a method and decodes its return value.
    pub async fn ask<A, R>(&self, method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self
            .client
            .request(
                self.binding_id,
                self.capability.clone(),
                method,
                codec::to_payload(args)?,
            )
            .await?;
        Ok(codec::from_payload(&reply)?)
    }

    /// Calls a method without waiting for it to be handled.
    pub async fn tell<A>(&self, method: &str, args: &A) -> Result<(), ClientError>
    where
        A: Serialize + ?Sized,
    {
        self.client
            .notify(
                self.binding_id,
                self.capability.clone(),
                method,
                codec::to_payload(args)?,
            )
            .await
    }
}

fn read_ack(
    options: &ClientOptions,
    frame: Option<Bytes>,
) -> Result<HandshakeAck, HandshakeError> {
    let frame = frame.ok_or(HandshakeError::ConnectionClosed)?;
    match framing::decode_frame(&*options.codec, &frame)? {
        Packet::HandshakeAck(ack) => Ok(ack),
        Packet::HandshakeReject(reject) => Err(HandshakeError::Rejected {
            reason: reject.reason,
        }),
        other => Err(HandshakeError::UnexpectedPacket(other.kind())),
    }
}

async fn read_loop(
    inner: Arc<ClientInner>,
    mut source: Box<dyn FrameSource>,
    codec: SharedCodec,
    events: mpsc::Sender<(SubscriberToken, Bytes)>,
) {
    loop {
        let frame = tokio::select! {
            _ = inner.closed.cancelled() => break,
            frame = source.recv_frame() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(channel_id = %inner.channel_id, "gateway closed the channel");
                break;
            }
            Err(err) => {
                debug!(channel_id = %inner.channel_id, %err, "connection read failed");
                break;
            }
        };

        match framing::decode_frame(&*codec, &frame) {
            Ok(Packet::Reply {
                correlation_id,
                result,
            }) => {
                let pending = inner.pending.lock().remove(&correlation_id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => trace!(correlation_id, "reply for an abandoned request"),
                }
            }
            Ok(Packet::Event(event)) => {
                let token = event.subscriber_token;
                match events.try_send((token, event.payload)) {
                    Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(channel_id = %inner.channel_id, %token, "event queue full, dropping event");
                    }
                }
            }
            Ok(other) => warn!(kind = ?other.kind(), "dropping unexpected packet"),
            Err(err) => warn!(%err, "dropping malformed frame"),
        }
    }

    inner.closed.cancel();
    // fails every pending request with `Closed`
    inner.pending.lock().clear();
}

async fn write_loop(
    mut outbound: mpsc::Receiver<Packet>,
    mut sink: Box<dyn FrameSink>,
    codec: SharedCodec,
    closed: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let frame = match framing::encode_frame(&*codec, &packet) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(kind = ?packet.kind(), %err, "failed to encode packet");
                continue;
            }
        };
        if let Err(err) = sink.send_frame(frame).await {
            debug!(%err, "connection write failed");
            break;
        }
    }

    if let Err(err) = sink.shutdown().await {
        trace!(%err, "connection shutdown failed");
    }
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use crate::{
        actor::{spawn, Actor},
        binding::{BindingFlags, BindingSpec},
        capability::CapabilityCatalog,
        codec::to_payload,
        error::FaultKind,
        gateway::{Gateway, GatewayBuilder, GatewayConfig},
        message::{Call, Context},
        transport::memory,
    };

    use super::*;

    const IECHO: Capability = Capability::from_static("IEcho");
    const IECHO_OBSERVER: Capability = Capability::from_static("IEchoObserver");

    struct Echo;

    impl Actor for Echo {
        async fn handle(&mut self, call: Call, ctx: Context) -> anyhow::Result<Bytes> {
            match call.method.as_str() {
                "Echo" => {
                    let text: String = call.args()?;
                    Ok(to_payload(&text)?)
                }
                "Sleep" => {
                    let millis: u64 = call.args()?;
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(to_payload(&millis)?)
                }
                "Watch" => {
                    let token: SubscriberToken = call.args()?;
                    if let Some(channel) = ctx.channel() {
                        channel.subscribe(ctx.actor_id(), IECHO_OBSERVER, token)?;
                    }
                    ctx.publish(&IECHO_OBSERVER, to_payload("watching")?);
                    Ok(to_payload(&())?)
                }
                method => anyhow::bail!("unhandled method {method}"),
            }
        }
    }

    async fn gateway(token_required: bool) -> Gateway {
        let catalog = CapabilityCatalog::builder()
            .register(IECHO, ["Echo", "Sleep", "Watch"])
            .register(IECHO_OBSERVER, ["Event"])
            .build()
            .unwrap();
        GatewayBuilder::new(GatewayConfig::passive().with_token_required(token_required))
            .catalog(catalog)
            .initial_bindings(|_, _| {
                Ok(vec![
                    BindingSpec::new(spawn(Echo), IECHO).with_flags(BindingFlags::STOP_ON_CLOSE),
                    BindingSpec::new(spawn(Echo), IECHO).with_flags(BindingFlags::STOP_ON_CLOSE),
                ])
            })
            .start()
            .await
            .unwrap()
    }

    async fn connect(
        gateway: &Gateway,
        options: ClientOptions,
    ) -> Result<ChannelClient, ClientError> {
        let (server, client) = memory::pair(
            SocketAddr::from(([127, 0, 0, 1], 5001)),
            SocketAddr::from(([127, 0, 0, 1], 40000)),
        );
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let _ = gateway.accept(server).await;
        });
        ChannelClient::connect(client, options).await
    }

    #[tokio::test]
    async fn requests_round_trip() {
        let gateway = gateway(false).await;
        let client = connect(&gateway, ClientOptions::default()).await.unwrap();

        let echo = client.binding_for(&IECHO).unwrap();
        let reply: String = client.bound(echo, IECHO).ask("Echo", "hi").await.unwrap();
        assert_eq!(reply, "hi");
        assert_eq!(gateway.channel_count(), 1);
    }

    #[tokio::test]
    async fn faults_are_returned_as_errors() {
        let gateway = gateway(false).await;
        let client = connect(&gateway, ClientOptions::default()).await.unwrap();

        let err = client
            .request(BindingId::new(42), IECHO, "Echo", to_payload("hi").unwrap())
            .await
            .unwrap_err();
        match err {
            ClientError::Fault(fault) => assert_eq!(fault.kind, FaultKind::UnknownBinding),
            err => panic!("expected a fault, got {err}"),
        }
        assert!(!client.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replies_are_matched_out_of_order() {
        let gateway = gateway(false).await;
        let client = connect(&gateway, ClientOptions::default()).await.unwrap();
        let first = client.bindings()[0].binding_id;
        let second = client.bindings()[1].binding_id;

        let slow = tokio::spawn({
            let slow = client.bound(first, IECHO);
            async move { slow.ask::<_, u64>("Sleep", &200u64).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast: String = client.bound(second, IECHO).ask("Echo", "fast").await.unwrap();
        assert_eq!(fast, "fast");
        assert!(!slow.is_finished());
        assert_eq!(slow.await.unwrap().unwrap(), 200);
    }

    #[tokio::test]
    async fn rejected_handshakes_surface_the_reason() {
        let gateway = gateway(true).await;
        let err = connect(&gateway, ClientOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Handshake(HandshakeError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn events_are_streamed() {
        let gateway = gateway(false).await;
        let client = connect(&gateway, ClientOptions::default()).await.unwrap();
        let mut events = client.events().unwrap();
        assert!(client.events().is_none());

        let echo = client.binding_for(&IECHO).unwrap();
        let token = SubscriberToken::new(3);
        client
            .bound(echo, IECHO)
            .ask::<_, ()>("Watch", &token)
            .await
            .unwrap();

        let (received, payload) = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, token);
        assert_eq!(codec::from_payload::<String>(&payload).unwrap(), "watching");
    }

    #[tokio::test]
    async fn unread_events_are_bounded() {
        let gateway = gateway(false).await;
        let client = connect(&gateway, ClientOptions::default().with_event_capacity(4))
            .await
            .unwrap();
        let echo = client.binding_for(&IECHO).unwrap();
        client
            .bound(echo, IECHO)
            .ask::<_, ()>("Watch", &SubscriberToken::new(1))
            .await
            .unwrap();

        let actor_id = gateway.channels()[0].binding(echo).unwrap().actor.id();
        for i in 0..9 {
            gateway
                .events()
                .publish(actor_id, &IECHO_OBSERVER, to_payload(&i).unwrap());
        }
        // replies are written after the events queued before them
        let reply: String = client.bound(echo, IECHO).ask("Echo", "flush").await.unwrap();
        assert_eq!(reply, "flush");

        let mut events = client.events().unwrap();
        let mut received = 0;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(50), events.next()).await {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn pending_requests_fail_when_the_channel_closes() {
        let gateway = gateway(false).await;
        let client = connect(&gateway, ClientOptions::default()).await.unwrap();
        let echo = client.binding_for(&IECHO).unwrap();

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.bound(echo, IECHO).ask::<_, u64>("Sleep", &5_000u64).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        for channel in gateway.channels() {
            channel.close();
        }

        let res = tokio::time::timeout(Duration::from_secs(1), request)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(ClientError::Closed)));
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closing_the_client_closes_the_channel() {
        let gateway = gateway(false).await;
        let client = connect(&gateway, ClientOptions::default()).await.unwrap();
        let channel = gateway.channels().pop().unwrap();

        client.close();
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
        assert!(matches!(
            client
                .notify(BindingId::new(1), IECHO, "Echo", Bytes::new())
                .await,
            Err(ClientError::Closed)
        ));
    }
}
