//! Bindings make an actor reachable from a channel's remote peer.
//!
//! A binding pairs an [`ActorRef`] with the [`CapabilitySet`] it exposes, under a
//! [`BindingId`] that is unique within its channel. The remote peer addresses requests by
//! binding id, never by actor identity, so a client can only reach actors the server chose to
//! bind on its channel.

use std::{collections::HashMap, fmt};

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    actor::{ActorId, ActorRef},
    capability::{Capability, CapabilitySet},
    error::ChannelError,
};

/// A channel-scoped handle for a bound actor, as seen by the remote peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingId(u32);

impl BindingId {
    /// Creates a binding id from its raw value.
    pub const fn new(id: u32) -> Self {
        BindingId(id)
    }

    /// Returns the raw value.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BindingId({})", self.0)
    }
}

bitflags! {
    /// Lifecycle options for a binding.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BindingFlags: u8 {
        /// Call [`Actor::on_bound`](crate::actor::Actor::on_bound) when the binding is created.
        const NOTIFY_ON_BIND = 1;
        /// Call [`Actor::on_unbound`](crate::actor::Actor::on_unbound) when the binding is released.
        const NOTIFY_ON_UNBIND = 1 << 1;
        /// Stop the actor when the binding is released because its channel closed.
        const STOP_ON_CLOSE = 1 << 2;
        /// Close the channel when the actor stops.
        const CLOSE_ON_STOP = 1 << 3;
    }
}

impl Default for BindingFlags {
    fn default() -> Self {
        BindingFlags::empty()
    }
}

/// Why a binding was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnbindReason {
    /// The binding was removed with [`Channel::unbind`](crate::channel::Channel::unbind).
    Unbound,
    /// The channel holding the binding was closed.
    ChannelClosed,
}

/// A live binding on a channel.
#[derive(Clone, Debug)]
pub struct Binding {
    /// The binding's id, unique within its channel.
    pub id: BindingId,
    /// The bound actor.
    pub actor: ActorRef,
    /// The capabilities the remote peer may invoke.
    pub capabilities: CapabilitySet,
    /// Lifecycle options.
    pub flags: BindingFlags,
}

impl Binding {
    /// Describes the binding for the remote peer.
    pub fn info(&self) -> BindingInfo {
        BindingInfo {
            binding_id: self.id,
            capabilities: self.capabilities.clone(),
        }
    }
}

/// A binding which has not been installed on a channel yet.
///
/// Produced by initial-binding factories and accepted by
/// [`Gateway::issue_token`](crate::gateway::Gateway::issue_token).
#[derive(Clone, Debug)]
pub struct BindingSpec {
    /// The actor to bind.
    pub actor: ActorRef,
    /// The capabilities to expose.
    pub capabilities: CapabilitySet,
    /// Lifecycle options.
    pub flags: BindingFlags,
}

impl BindingSpec {
    /// Creates a binding spec with no flags.
    pub fn new(actor: ActorRef, capabilities: impl Into<CapabilitySet>) -> Self {
        BindingSpec {
            actor,
            capabilities: capabilities.into(),
            flags: BindingFlags::empty(),
        }
    }

    /// Sets the binding's lifecycle flags.
    pub fn with_flags(mut self, flags: BindingFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// What the remote peer learns about a binding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingInfo {
    /// The id to address requests to.
    pub binding_id: BindingId,
    /// The capabilities exposed by the binding.
    pub capabilities: CapabilitySet,
}

/// The per-channel table of bindings.
#[derive(Debug)]
pub struct BindingRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    bindings: HashMap<BindingId, Binding>,
    next_id: u32,
}

impl RegistryInner {
    fn find(&self, actor_id: ActorId, capabilities: &CapabilitySet) -> Option<BindingId> {
        self.bindings
            .values()
            .find(|binding| binding.actor.id() == actor_id && &binding.capabilities == capabilities)
            .map(|binding| binding.id)
    }
}

impl BindingRegistry {
    /// Creates an empty registry. Ids are allocated starting at 1.
    pub fn new() -> Self {
        BindingRegistry {
            inner: RwLock::new(RegistryInner {
                bindings: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Allocates a fresh id and inserts the binding.
    ///
    /// Binding the same actor twice with an identical capability set is rejected with the
    /// existing id.
    pub fn insert(&self, spec: BindingSpec) -> Result<Binding, ChannelError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.find(spec.actor.id(), &spec.capabilities) {
            return Err(ChannelError::DuplicateBinding {
                actor_id: spec.actor.id(),
                existing,
            });
        }

        let id = BindingId(inner.next_id);
        inner.next_id = id.0.checked_add(1).ok_or(ChannelError::BindingIdsExhausted)?;
        let binding = Binding {
            id,
            actor: spec.actor,
            capabilities: spec.capabilities,
            flags: spec.flags,
        };
        inner.bindings.insert(id, binding.clone());

        Ok(binding)
    }

    /// Inserts a binding under its existing id, as when resuming a session.
    ///
    /// Later allocations continue after the highest restored id.
    pub fn restore(&self, binding: Binding) -> Result<(), ChannelError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.find(binding.actor.id(), &binding.capabilities) {
            return Err(ChannelError::DuplicateBinding {
                actor_id: binding.actor.id(),
                existing,
            });
        }
        if let Some(existing) = inner.bindings.get(&binding.id) {
            return Err(ChannelError::DuplicateBinding {
                actor_id: existing.actor.id(),
                existing: existing.id,
            });
        }

        let next_id = binding
            .id
            .0
            .checked_add(1)
            .ok_or(ChannelError::BindingIdsExhausted)?;
        inner.next_id = inner.next_id.max(next_id);
        inner.bindings.insert(binding.id, binding);

        Ok(())
    }

    /// Removes a binding.
    pub fn remove(&self, id: BindingId) -> Option<Binding> {
        self.inner.write().bindings.remove(&id)
    }

    /// Removes every binding.
    pub fn drain(&self) -> Vec<Binding> {
        let mut bindings: Vec<_> = self
            .inner
            .write()
            .bindings
            .drain()
            .map(|(_, binding)| binding)
            .collect();
        bindings.sort_by_key(|binding| binding.id);
        bindings
    }

    /// Returns a binding by id.
    pub fn get(&self, id: BindingId) -> Option<Binding> {
        self.inner.read().bindings.get(&id).cloned()
    }

    /// Looks up the actor behind a binding, checking that it exposes the capability.
    pub fn resolve(&self, id: BindingId, capability: &Capability) -> Result<ActorRef, ChannelError> {
        let inner = self.inner.read();
        let binding = inner
            .bindings
            .get(&id)
            .ok_or(ChannelError::UnknownBinding(id))?;
        if !binding.capabilities.contains(capability) {
            return Err(ChannelError::CapabilityMismatch {
                binding_id: id,
                capability: capability.clone(),
            });
        }

        Ok(binding.actor.clone())
    }

    /// Finds the binding of an actor with exactly the given capabilities.
    pub fn find(&self, actor_id: ActorId, capabilities: &CapabilitySet) -> Option<BindingId> {
        self.inner.read().find(actor_id, capabilities)
    }

    /// Returns every binding, ordered by id.
    pub fn snapshot(&self) -> Vec<Binding> {
        let mut bindings: Vec<_> = self.inner.read().bindings.values().cloned().collect();
        bindings.sort_by_key(|binding| binding.id);
        bindings
    }

    /// Describes every binding, ordered by id.
    pub fn infos(&self) -> Vec<BindingInfo> {
        let mut infos: Vec<_> = self
            .inner
            .read()
            .bindings
            .values()
            .map(Binding::info)
            .collect();
        infos.sort_by_key(|info| info.binding_id);
        infos
    }

    /// The number of bindings.
    pub fn len(&self) -> usize {
        self.inner.read().bindings.len()
    }

    /// Returns `true` if there are no bindings.
    pub fn is_empty(&self) -> bool {
        self.inner.read().bindings.is_empty()
    }
}

impl Default for BindingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
