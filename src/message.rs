//! Messaging primitives passed to [`Actor::handle`](crate::actor::Actor::handle).
//!
//! A [`Call`] is one invocation of a capability method, carrying the still-encoded arguments.
//! The [`Context`] describes where it came from, which is either a binding on a channel or a
//! local caller holding the actor's reference.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::{
    actor::ActorId,
    binding::BindingId,
    capability::Capability,
    channel::Channel,
    codec::{self, CodecError},
    event::EventBus,
};

/// A single method invocation delivered to an actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// The capability the method belongs to.
    pub capability: Capability,
    /// The method selector.
    pub method: String,
    /// The encoded arguments.
    pub args: Bytes,
}

impl Call {
    /// Creates a new call.
    pub fn new(capability: Capability, method: impl Into<String>, args: Bytes) -> Self {
        Call {
            capability,
            method: method.into(),
            args,
        }
    }

    /// Decodes the call's arguments with the default payload encoding.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::from_payload(&self.args)
    }
}

/// The channel and binding a call arrived through.
#[derive(Clone, Debug)]
pub(crate) struct Origin {
    pub(crate) channel: Channel,
    pub(crate) binding_id: BindingId,
}

/// Information about the call currently being handled.
#[derive(Clone)]
pub struct Context {
    actor_id: ActorId,
    origin: Option<Origin>,
}

impl Context {
    pub(crate) fn new(actor_id: ActorId, origin: Option<Origin>) -> Self {
        Context { actor_id, origin }
    }

    /// The id of the actor handling the call.
    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    /// The channel the call arrived on, or `None` for local calls.
    pub fn channel(&self) -> Option<&Channel> {
        self.origin.as_ref().map(|origin| &origin.channel)
    }

    /// The binding the call targeted, or `None` for local calls.
    pub fn binding_id(&self) -> Option<BindingId> {
        self.origin.as_ref().map(|origin| origin.binding_id)
    }

    /// The event bus of the originating channel, if any.
    pub fn events(&self) -> Option<&EventBus> {
        self.channel().map(Channel::events)
    }

    /// Publishes an event from the current actor on the originating channel's event bus.
    ///
    /// Returns the number of channels the event was offered to. Local calls publish nowhere
    /// and return 0.
    pub fn publish(&self, capability: &Capability, payload: Bytes) -> usize {
        match self.events() {
            Some(events) => events.publish(self.actor_id, capability, payload),
            None => 0,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("actor_id", &self.actor_id)
            .field("channel_id", &self.channel().map(Channel::id))
            .field("binding_id", &self.binding_id())
            .finish()
    }
}
