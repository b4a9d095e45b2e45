//! Directories of shared actors, looked up by name.
//!
//! Actors which outlive any single channel, such as a user directory or a room list, are
//! registered in a [`Directory`] at start-up. Entry actors receive the directory when they are
//! constructed and resolve shared actors from it, instead of reaching for a global.

use std::{
    borrow::{Borrow, Cow},
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::actor::ActorRef;

/// Looks up shared actors by name.
pub trait Directory: Send + Sync + 'static {
    /// Returns the live actor registered under the name, if any.
    fn lookup(&self, name: &str) -> Option<ActorRef>;
}

/// An in-process directory storing actor refs by name.
#[derive(Clone, Default)]
pub struct LocalDirectory {
    actor_refs: Arc<RwLock<HashMap<Cow<'static, str>, ActorRef>>>,
}

impl LocalDirectory {
    /// Creates a new empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every registered name, in arbitrary order.
    pub fn names(&self) -> Vec<String> {
        self.actor_refs
            .read()
            .keys()
            .map(|name| name.to_string())
            .collect()
    }

    /// The number of registered actor refs.
    pub fn len(&self) -> usize {
        self.actor_refs.read().len()
    }

    /// Returns `true` if the directory contains no actor refs.
    pub fn is_empty(&self) -> bool {
        self.actor_refs.read().is_empty()
    }

    /// Returns `true` if an actor has been registered under a given name.
    pub fn contains_name<Q>(&self, name: &Q) -> bool
    where
        Q: Hash + Eq + ?Sized,
        Cow<'static, str>: Borrow<Q>,
    {
        self.actor_refs.read().contains_key(name)
    }

    /// Inserts a new actor ref under a given name, which can be used later to be looked up.
    ///
    /// Returns `false` if the name is already taken.
    pub fn insert(&self, name: impl Into<Cow<'static, str>>, actor_ref: ActorRef) -> bool {
        let name = name.into();
        let mut actor_refs = self.actor_refs.write();
        if actor_refs.contains_key(&name) {
            return false;
        }

        actor_refs.insert(name, actor_ref);
        true
    }

    /// Removes a previously registered actor ref under a given name.
    pub fn remove<Q>(&self, name: &Q) -> bool
    where
        Q: Hash + Eq + ?Sized,
        Cow<'static, str>: Borrow<Q>,
    {
        self.actor_refs.write().remove(name).is_some()
    }
}

impl Directory for LocalDirectory {
    fn lookup(&self, name: &str) -> Option<ActorRef> {
        self.actor_refs
            .read()
            .get(name)
            .filter(|actor_ref| actor_ref.is_alive())
            .cloned()
    }
}

impl fmt::Debug for LocalDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDirectory")
            .field("len", &self.len())
            .finish()
    }
}
