//! Channels carry the traffic of one client connection.
//!
//! A [`Channel`] owns the bindings its client may address, the client's event subscriptions,
//! and the tasks that read and write its connection. Inbound requests are routed by binding id,
//! checked against the binding's capabilities and the [`CapabilityCatalog`], and enqueued on the
//! bound actor's mailbox in the order they arrived. Replies are written back as soon as each
//! actor answers, so requests to different actors complete in any order and are matched by
//! correlation id on the client.
//!
//! Closing a channel releases every binding, drops every subscription and stops its tasks.
//! Close is idempotent and may be triggered by the peer disconnecting, a transport error, a
//! bound actor stopping under [`BindingFlags::CLOSE_ON_STOP`], or the owning gateway stopping.

use std::{
    collections::HashMap,
    fmt, io, mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    actor::{ActorId, ActorRef},
    binding::{
        Binding, BindingFlags, BindingId, BindingInfo, BindingRegistry, BindingSpec,
        UnbindReason,
    },
    capability::{Capability, CapabilityCatalog, CapabilitySet},
    codec::{MsgPackCodec, PacketCodec, SharedCodec},
    error::{ChannelError, Fault, FaultKind, InvokeError},
    event::{ActorEvent, EventBus, EventListener},
    framing::{self, DEFAULT_MAX_FRAME_SIZE},
    mailbox::Signal,
    message::{Call, Origin},
    observer::{ObserverRegistry, SubscriberToken},
    packet::{Event, Packet, Request},
    session::{ReconnectToken, SessionStore, DEFAULT_TOKEN_TTL},
    transport::{udp::MAX_DATAGRAM_SIZE, FrameSink, FrameSource, TransportKind},
};

/// Default capacity of a channel's outbound packet queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

static CHANNEL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies a channel within the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Creates a channel id from its raw value.
    pub const fn new(id: u64) -> Self {
        ChannelId(id)
    }

    /// Generates a new unique channel id.
    pub fn generate() -> Self {
        ChannelId(CHANNEL_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// Collaborators shared by every channel of a gateway.
#[derive(Clone, Debug)]
pub struct ChannelContext {
    /// The capabilities requests are validated against.
    pub catalog: Arc<CapabilityCatalog>,
    /// The codec for packet bodies.
    pub codec: SharedCodec,
    /// Where reconnect tokens are issued.
    pub sessions: SessionStore,
    /// Where bound actors publish events.
    pub events: EventBus,
    /// Time to live of minted reconnect tokens.
    pub token_ttl: Duration,
    /// Capacity of each channel's outbound queue.
    pub outbound_capacity: usize,
    /// Largest frame written to a peer. Datagram channels are further capped at
    /// [`MAX_DATAGRAM_SIZE`].
    pub max_frame_size: usize,
}

impl ChannelContext {
    /// Creates a context with a fresh session store and event bus.
    pub fn new(catalog: Arc<CapabilityCatalog>) -> Self {
        ChannelContext {
            catalog,
            codec: Arc::new(MsgPackCodec),
            sessions: SessionStore::new(),
            events: EventBus::new(),
            token_ttl: DEFAULT_TOKEN_TTL,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

type CloseHook = Box<dyn FnOnce(ChannelId) + Send>;

/// The latest reconnect token minted by a channel.
struct MintedToken {
    token: ReconnectToken,
    redeemed: CancellationToken,
    captured: Vec<BindingId>,
}
type PendingReply = oneshot::Receiver<Result<Bytes, InvokeError>>;

/// Calls waiting for room in the mailbox of an actor whose mailbox was full.
type Backlogs = Mutex<HashMap<ActorId, mpsc::UnboundedSender<Signal>>>;

/// A live client connection and the bindings reachable through it.
///
/// `Channel` is a cheap, clonable handle.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// A handle to a channel which does not keep it alive.
#[derive(Clone, Debug)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    /// Returns the channel if it still exists.
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

struct ChannelInner {
    id: ChannelId,
    remote_addr: SocketAddr,
    transport: TransportKind,
    context: ChannelContext,
    bindings: BindingRegistry,
    observers: ObserverRegistry,
    outbound: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    max_frame_size: usize,
    backlogs: Backlogs,
    reconnect_token: Mutex<Option<MintedToken>>,
    failure: Mutex<Option<Arc<ChannelError>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    stop_reading: CancellationToken,
    tasks: TaskTracker,
    close_hooks: Mutex<Vec<CloseHook>>,
}

impl Channel {
    /// Creates a channel which is not yet attached to a connection.
    ///
    /// Packets queued before the channel is attached are written once it is.
    pub fn new(context: ChannelContext, remote_addr: SocketAddr, transport: TransportKind) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(context.outbound_capacity.max(1));
        let max_frame_size = match transport {
            TransportKind::Udp => context.max_frame_size.min(MAX_DATAGRAM_SIZE),
            _ => context.max_frame_size,
        };
        let shutdown = CancellationToken::new();
        Channel {
            inner: Arc::new(ChannelInner {
                id: ChannelId::generate(),
                remote_addr,
                transport,
                context,
                bindings: BindingRegistry::new(),
                observers: ObserverRegistry::new(),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                max_frame_size,
                backlogs: Mutex::new(HashMap::new()),
                reconnect_token: Mutex::new(None),
                failure: Mutex::new(None),
                closed: AtomicBool::new(false),
                stop_reading: shutdown.child_token(),
                shutdown,
                tasks: TaskTracker::new(),
                close_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The channel's id.
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// The address of the client.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// The transport the client is connected over.
    pub fn transport(&self) -> TransportKind {
        self.inner.transport
    }

    /// The capability catalog requests are validated against.
    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.inner.context.catalog
    }

    /// The event bus bound actors publish on.
    pub fn events(&self) -> &EventBus {
        &self.inner.context.events
    }

    /// The shared collaborators of the channel.
    pub fn context(&self) -> &ChannelContext {
        &self.inner.context
    }

    /// Returns a weak handle to the channel.
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns `true` once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Waits for the channel to close.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// The number of requests whose replies are still being awaited, plus one for each actor
    /// with calls waiting for room in its mailbox.
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// The connection failure which closed the channel, if any.
    ///
    /// `None` while the channel is open, and after a clean close by either side.
    pub fn failure(&self) -> Option<Arc<ChannelError>> {
        self.inner.failure.lock().clone()
    }

    // ── Bindings ────────────────────────────────────────────────────────

    /// Binds an actor on the channel, returning the id the client addresses it by.
    ///
    /// Every capability must be registered in the catalog.
    pub fn bind(
        &self,
        actor: ActorRef,
        capabilities: impl Into<CapabilitySet>,
        flags: BindingFlags,
    ) -> Result<BindingId, ChannelError> {
        self.bind_spec(BindingSpec {
            actor,
            capabilities: capabilities.into(),
            flags,
        })
    }

    /// Binds an actor described by a [`BindingSpec`].
    pub fn bind_spec(&self, spec: BindingSpec) -> Result<BindingId, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.validate_capabilities(&spec.capabilities)?;

        let binding = self.inner.bindings.insert(spec)?;
        self.admit(binding)
    }

    /// Installs a binding under its existing id, as when resuming a session.
    pub(crate) fn restore(&self, binding: Binding) -> Result<BindingId, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.validate_capabilities(&binding.capabilities)?;

        self.inner.bindings.restore(binding.clone())?;
        self.admit(binding)
    }

    /// Installs a binding which was just inserted, unless the channel closed meanwhile.
    fn admit(&self, binding: Binding) -> Result<BindingId, ChannelError> {
        // close sets the flag before draining, so a binding inserted after the drain sees it
        if self.is_closed() {
            if let Some(binding) = self.inner.bindings.remove(binding.id) {
                self.release(binding, UnbindReason::ChannelClosed, false);
            }
            return Err(ChannelError::Closed);
        }
        self.install(&binding);
        Ok(binding.id)
    }

    /// Removes a binding. Later requests to it fail with an unknown binding fault.
    pub fn unbind(&self, binding_id: BindingId) -> Result<(), ChannelError> {
        let binding = self
            .inner
            .bindings
            .remove(binding_id)
            .ok_or(ChannelError::UnknownBinding(binding_id))?;
        debug!(channel_id = %self.id(), %binding_id, actor_id = %binding.actor.id(), "actor unbound");
        self.release(binding, UnbindReason::Unbound, false);
        Ok(())
    }

    /// Describes every binding, ordered by id.
    pub fn bindings(&self) -> Vec<BindingInfo> {
        self.inner.bindings.infos()
    }

    /// Returns a binding by id.
    pub fn binding(&self, binding_id: BindingId) -> Option<Binding> {
        self.inner.bindings.get(binding_id)
    }

    /// Finds the binding of an actor with exactly the given capabilities.
    pub fn find_binding(
        &self,
        actor_id: ActorId,
        capabilities: &CapabilitySet,
    ) -> Option<BindingId> {
        self.inner.bindings.find(actor_id, capabilities)
    }

    /// The number of bindings.
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.len()
    }

    fn validate_capabilities(&self, capabilities: &CapabilitySet) -> Result<(), ChannelError> {
        match capabilities
            .iter()
            .find(|capability| !self.inner.context.catalog.contains(capability))
        {
            Some(unknown) => Err(ChannelError::UnknownCapability(unknown.clone())),
            None => Ok(()),
        }
    }

    fn install(&self, binding: &Binding) {
        debug!(
            channel_id = %self.id(),
            binding_id = %binding.id,
            actor_id = %binding.actor.id(),
            capabilities = ?binding.capabilities,
            "actor bound"
        );
        if binding.flags.contains(BindingFlags::NOTIFY_ON_BIND) {
            binding.actor.signal_detached(Signal::Bound {
                channel_id: self.id(),
                binding_id: binding.id,
            });
        }
        if binding.flags.contains(BindingFlags::CLOSE_ON_STOP) {
            self.close_when_stopped(binding);
        }
    }

    fn close_when_stopped(&self, binding: &Binding) {
        let channel = self.downgrade();
        let binding_id = binding.id;
        let actor_id = binding.actor.id();
        let stopped = binding.actor.stopped_token();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = stopped.cancelled() => {
                    let Some(channel) = channel.upgrade() else {
                        return;
                    };
                    let still_bound = channel
                        .binding(binding_id)
                        .is_some_and(|binding| binding.actor.id() == actor_id);
                    if still_bound {
                        debug!(channel_id = %channel.id(), %actor_id, "bound actor stopped, closing channel");
                        channel.close();
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    fn release(&self, binding: Binding, reason: UnbindReason, handed_off: bool) {
        if binding.flags.contains(BindingFlags::NOTIFY_ON_UNBIND) {
            binding.actor.signal_detached(Signal::Unbound {
                channel_id: self.id(),
                binding_id: binding.id,
                reason,
            });
        }
        if reason == UnbindReason::ChannelClosed
            && !handed_off
            && binding.flags.contains(BindingFlags::STOP_ON_CLOSE)
        {
            binding.actor.signal_detached(Signal::Stop);
        }
    }

    // ── Observers ───────────────────────────────────────────────────────

    /// Subscribes the client to events an actor publishes under a capability.
    ///
    /// Events are delivered tagged with `token`. Subscribing twice with the same token has no
    /// further effect.
    pub fn subscribe(
        &self,
        actor_id: ActorId,
        capability: Capability,
        token: SubscriberToken,
    ) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if !self.inner.context.catalog.contains(&capability) {
            return Err(ChannelError::UnknownCapability(capability));
        }

        debug!(channel_id = %self.id(), %actor_id, %capability, %token, "observer subscribed");
        self.inner.observers.subscribe(actor_id, capability, token);
        let listener = Arc::downgrade(&self.inner);
        let listener: Weak<dyn EventListener> = listener;
        self.inner
            .context
            .events
            .listen(actor_id, self.id(), listener);
        Ok(())
    }

    /// Removes a subscription, returning `false` if it did not exist.
    pub fn unsubscribe(
        &self,
        actor_id: ActorId,
        capability: &Capability,
        token: SubscriberToken,
    ) -> bool {
        let removed = self.inner.observers.unsubscribe(actor_id, capability, token);
        if removed {
            debug!(channel_id = %self.id(), %actor_id, %capability, %token, "observer unsubscribed");
            if !self.inner.observers.is_observed(actor_id) {
                self.inner.context.events.unlisten(actor_id, self.id());
            }
        }
        removed
    }

    /// The number of event subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.observers.len()
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// Mints a single use token which resumes the channel's current bindings elsewhere.
    ///
    /// Minting again revokes the previous token. Bindings captured by a token which is still
    /// pending or has been redeemed are not stopped when this channel closes, even with
    /// [`BindingFlags::STOP_ON_CLOSE`], since the session resuming them owns them from then on.
    pub fn mint_reconnect_token(&self) -> Result<ReconnectToken, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let context = &self.inner.context;
        let bindings = self.inner.bindings.snapshot();
        let captured = bindings.iter().map(|binding| binding.id).collect();
        let (token, redeemed) =
            context
                .sessions
                .issue_tracked(bindings, Some(self.id()), context.token_ttl);
        let minted = MintedToken {
            token,
            redeemed,
            captured,
        };
        if let Some(previous) = self.inner.reconnect_token.lock().replace(minted) {
            context.sessions.revoke(&previous.token);
        }
        debug!(channel_id = %self.id(), "reconnect token minted");

        Ok(token)
    }

    /// The most recently minted reconnect token, if any.
    pub fn reconnect_token(&self) -> Option<ReconnectToken> {
        self.inner
            .reconnect_token
            .lock()
            .as_ref()
            .map(|minted| minted.token)
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Handles an inbound packet, returning the reply to send, if any.
    ///
    /// Requests always produce a reply, carrying a fault when the request could not be handled.
    /// One-way calls and packets a client should never send produce none.
    pub async fn dispatch(&self, packet: Packet) -> Option<Packet> {
        match packet {
            Packet::Request {
                correlation_id,
                request,
            } => {
                let result = match self.submit(request) {
                    Ok(pending) => await_reply(pending).await,
                    Err(fault) => Err(fault),
                };
                Some(Packet::Reply {
                    correlation_id,
                    result,
                })
            }
            Packet::OneWay(request) => {
                self.submit_one_way(request);
                None
            }
            other => {
                warn!(channel_id = %self.id(), kind = ?other.kind(), "dropping unexpected packet");
                None
            }
        }
    }

    fn route(&self, request: Request) -> Result<(ActorRef, Call, Origin), ChannelError> {
        let actor = self
            .inner
            .bindings
            .resolve(request.binding_id, &request.capability)?;
        if !self
            .inner
            .context
            .catalog
            .has_method(&request.capability, &request.method)
        {
            return Err(ChannelError::UnknownMethod {
                capability: request.capability,
                method: request.method,
            });
        }

        let origin = Origin {
            channel: self.clone(),
            binding_id: request.binding_id,
        };
        let call = Call::new(request.capability, request.method, request.args);
        Ok((actor, call, origin))
    }

    fn submit(&self, request: Request) -> Result<PendingReply, Fault> {
        let (actor, call, origin) = self.route(request)?;
        trace!(channel_id = %self.id(), actor_id = %actor.id(), method = %call.method, "request");
        let (reply, rx) = oneshot::channel();
        self.deliver(
            &actor,
            Signal::Invoke {
                call,
                origin: Some(origin),
                reply: Some(reply),
            },
        )?;
        Ok(rx)
    }

    fn submit_one_way(&self, request: Request) {
        let binding_id = request.binding_id;
        let res = match self.route(request) {
            Ok((actor, call, origin)) => self
                .deliver(
                    &actor,
                    Signal::Invoke {
                        call,
                        origin: Some(origin),
                        reply: None,
                    },
                )
                .map_err(Fault::from),
            Err(err) => Err(Fault::from(err)),
        };
        if let Err(fault) = res {
            debug!(channel_id = %self.id(), %binding_id, %fault, "one-way call dropped");
        }
    }

    /// Hands a call to its actor without waiting for mailbox space.
    ///
    /// Once an actor's mailbox is full, its calls queue up in a backlog drained by a tracked
    /// task, so they keep their order while calls to other actors go straight through.
    fn deliver(&self, actor: &ActorRef, signal: Signal) -> Result<(), InvokeError> {
        let mut backlogs = self.inner.backlogs.lock();
        if let Some(backlog) = backlogs.get(&actor.id()) {
            return backlog.send(signal).map_err(|_| InvokeError::ActorStopped);
        }

        match actor.try_deliver(signal) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(InvokeError::ActorStopped),
            Err(TrySendError::Full(signal)) => {
                trace!(channel_id = %self.id(), actor_id = %actor.id(), "mailbox full, queueing calls");
                let (backlog, queued) = mpsc::unbounded_channel();
                backlog
                    .send(signal)
                    .map_err(|_| InvokeError::ActorStopped)?;
                backlogs.insert(actor.id(), backlog);
                self.inner
                    .tasks
                    .spawn(drain_backlog(self.clone(), actor.clone(), queued));
                Ok(())
            }
        }
    }

    /// Keeps the first connection failure as the reason the channel closed.
    fn fail(&self, err: io::Error) {
        let mut failure = self.inner.failure.lock();
        if failure.is_none() {
            *failure = Some(Arc::new(ChannelError::Transport(err)));
        }
    }

    /// Handles a frame read from the connection.
    ///
    /// Calls are handed to their actor, or to its backlog, before the next frame is read,
    /// which keeps their order. Waiting for replies happens on tracked tasks.
    async fn handle_frame(&self, frame: Bytes) {
        let packet = match framing::decode_frame(&*self.inner.context.codec, &frame) {
            Ok(packet) => packet,
            Err(err) => {
                match err.request_correlation() {
                    Some(correlation_id) => {
                        warn!(channel_id = %self.id(), correlation_id, %err, "malformed request");
                        self.enqueue(Packet::Reply {
                            correlation_id,
                            result: Err(Fault::from(&err)),
                        })
                        .await;
                    }
                    None => warn!(channel_id = %self.id(), %err, "dropping malformed frame"),
                }
                return;
            }
        };

        match packet {
            Packet::Request {
                correlation_id,
                request,
            } => match self.submit(request) {
                Ok(pending) => {
                    let channel = self.clone();
                    self.inner.tasks.spawn(async move {
                        let result = await_reply(pending).await;
                        channel
                            .enqueue(Packet::Reply {
                                correlation_id,
                                result,
                            })
                            .await;
                    });
                }
                Err(fault) => {
                    self.enqueue(Packet::Reply {
                        correlation_id,
                        result: Err(fault),
                    })
                    .await;
                }
            },
            packet => {
                self.dispatch(packet).await;
            }
        }
    }

    async fn enqueue(&self, packet: Packet) {
        if self.inner.outbound.send(packet).await.is_err() {
            trace!(channel_id = %self.id(), "outbound queue closed, dropping packet");
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Starts the tasks that read and write the connection.
    pub(crate) fn attach(
        &self,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        idle_timeout: Option<Duration>,
    ) {
        let Some(outbound_rx) = self.inner.outbound_rx.lock().take() else {
            warn!(channel_id = %self.id(), "channel is already attached");
            return;
        };

        let span = info_span!("channel", id = %self.id(), remote = %self.remote_addr());
        tokio::spawn(write_loop(self.clone(), outbound_rx, sink).instrument(span.clone()));
        tokio::spawn(read_loop(self.clone(), source, idle_timeout).instrument(span));
    }

    /// Registers a callback run once when the channel closes.
    ///
    /// Runs immediately if the channel is already closed.
    pub(crate) fn on_close(&self, hook: impl FnOnce(ChannelId) + Send + 'static) {
        let mut hooks = self.inner.close_hooks.lock();
        if self.is_closed() {
            drop(hooks);
            hook(self.id());
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Closes the channel, releasing every binding and subscription.
    ///
    /// Replies and events already queued are still written. Closing an already closed channel
    /// does nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.tasks.close();
        inner.context.events.unlisten_all(inner.id);
        inner.observers.clear();

        let handed_off: Vec<BindingId> = match &*inner.reconnect_token.lock() {
            Some(minted)
                if minted.redeemed.is_cancelled()
                    || inner.context.sessions.contains(&minted.token) =>
            {
                minted.captured.clone()
            }
            _ => Vec::new(),
        };
        for binding in inner.bindings.drain() {
            let handed_off = handed_off.contains(&binding.id);
            self.release(binding, UnbindReason::ChannelClosed, handed_off);
        }

        let hooks = mem::take(&mut *inner.close_hooks.lock());
        for hook in hooks {
            hook(inner.id);
        }

        info!(channel_id = %inner.id, remote = %inner.remote_addr, "channel closed");
    }

    /// Stops reading new requests, waits up to `timeout` for in-flight requests to be answered,
    /// then closes the channel.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn drain_and_close(&self, timeout: Duration) -> bool {
        self.inner.stop_reading.cancel();
        self.inner.tasks.close();
        let drained = tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_ok();
        self.close();
        drained
    }
}

async fn await_reply(pending: PendingReply) -> Result<Bytes, Fault> {
    match pending.await {
        Ok(res) => res.map_err(Fault::from),
        Err(_) => Err(Fault::from(InvokeError::ActorStopped)),
    }
}

/// Feeds an actor the calls which queued up behind its full mailbox, in order.
///
/// The backlog is removed once empty, so later calls try the mailbox directly again.
async fn drain_backlog(
    channel: Channel,
    actor: ActorRef,
    mut queued: mpsc::UnboundedReceiver<Signal>,
) {
    let shutdown = channel.inner.shutdown.clone();
    loop {
        let next = queued.try_recv().ok().or_else(|| {
            let mut backlogs = channel.inner.backlogs.lock();
            // senders only push while holding the lock
            let next = queued.try_recv().ok();
            if next.is_none() {
                backlogs.remove(&actor.id());
            }
            next
        });
        let Some(signal) = next else {
            return;
        };

        let delivered = tokio::select! {
            _ = shutdown.cancelled() => false,
            res = actor.deliver(signal) => res.is_ok(),
        };
        if !delivered {
            break;
        }
    }

    trace!(channel_id = %channel.id(), actor_id = %actor.id(), "dropping queued calls");
    channel.inner.backlogs.lock().remove(&actor.id());
}

async fn read_loop(
    channel: Channel,
    mut source: Box<dyn FrameSource>,
    idle_timeout: Option<Duration>,
) {
    let stop_reading = channel.inner.stop_reading.clone();
    loop {
        let next = async {
            match idle_timeout {
                Some(idle) => tokio::time::timeout(idle, source.recv_frame())
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "connection idle"))
                    }),
                None => source.recv_frame().await,
            }
        };
        let frame = tokio::select! {
            _ = stop_reading.cancelled() => return,
            frame = next => frame,
        };

        match frame {
            Ok(Some(frame)) => channel.handle_frame(frame).await,
            Ok(None) => {
                debug!("peer closed the connection");
                break;
            }
            Err(err) => {
                warn!(channel_id = %channel.id(), %err, "connection read failed");
                channel.fail(err);
                break;
            }
        }
    }

    channel.close();
}

async fn write_loop(
    channel: Channel,
    mut outbound: mpsc::Receiver<Packet>,
    mut sink: Box<dyn FrameSink>,
) {
    let shutdown = channel.inner.shutdown.clone();
    let codec = channel.inner.context.codec.clone();
    let max_frame_size = channel.inner.max_frame_size;
    let mut healthy = true;

    loop {
        let packet = tokio::select! {
            biased;
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        if let Err(err) = write_packet(&*codec, &mut *sink, packet, max_frame_size).await {
            warn!(channel_id = %channel.id(), %err, "connection write failed");
            channel.fail(err);
            healthy = false;
            break;
        }
    }

    // flush what was queued before the close
    outbound.close();
    if healthy {
        while let Ok(packet) = outbound.try_recv() {
            if let Err(err) = write_packet(&*codec, &mut *sink, packet, max_frame_size).await {
                debug!(channel_id = %channel.id(), %err, "connection write failed while closing");
                break;
            }
        }
    }
    if let Err(err) = sink.shutdown().await {
        trace!(%err, "connection shutdown failed");
    }

    channel.close();
}

/// Writes one packet, skipping those which cannot be encoded within `max_frame_size`.
///
/// A reply which is too large is answered with a [`FaultKind::FrameTooLarge`] fault instead.
/// Only connection failures are returned.
async fn write_packet(
    codec: &dyn PacketCodec,
    sink: &mut dyn FrameSink,
    packet: Packet,
    max_frame_size: usize,
) -> io::Result<()> {
    let Some(frame) = encode_within(codec, &packet, max_frame_size) else {
        let Packet::Reply { correlation_id, .. } = packet else {
            return Ok(());
        };
        let fault = Packet::Reply {
            correlation_id,
            result: Err(Fault::new(
                FaultKind::FrameTooLarge,
                format!("reply exceeds the {max_frame_size} byte frame limit"),
            )),
        };
        return match encode_within(codec, &fault, max_frame_size) {
            Some(frame) => sink.send_frame(frame).await,
            None => Ok(()),
        };
    };
    sink.send_frame(frame).await
}

fn encode_within(codec: &dyn PacketCodec, packet: &Packet, max_frame_size: usize) -> Option<Bytes> {
    match framing::encode_frame(codec, packet) {
        Ok(frame) if frame.len() <= max_frame_size => Some(frame),
        Ok(frame) => {
            warn!(
                kind = ?packet.kind(),
                len = frame.len(),
                max_frame_size,
                "packet exceeds the frame limit, dropping it"
            );
            None
        }
        Err(err) => {
            warn!(kind = ?packet.kind(), %err, "failed to encode packet");
            None
        }
    }
}

impl EventListener for ChannelInner {
    fn on_event(&self, event: &ActorEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        for token in self.observers.subscribers(event.actor_id, &event.capability) {
            let packet = Packet::Event(Event {
                subscriber_token: token,
                payload: event.payload.clone(),
            });
            match self.outbound.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(channel_id = %self.id, %token, "outbound queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("transport", &self.inner.transport)
            .field("bindings", &self.inner.bindings.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
