//! Per-channel event subscriptions.
//!
//! A remote peer subscribes to events of a bound actor's capability through a
//! [`SubscriberToken`] it chose. When that actor publishes an event under the capability, the
//! channel forwards the payload once per token, tagged with the token, so the client can route
//! it to the right local observer.

use std::{collections::HashMap, fmt};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{actor::ActorId, capability::Capability};

/// Identifies a subscriber on the client side of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberToken(u32);

impl SubscriberToken {
    /// Creates a token from its raw value.
    pub const fn new(token: u32) -> Self {
        SubscriberToken(token)
    }

    /// Returns the raw value.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubscriberToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SubscriberToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberToken({})", self.0)
    }
}

/// Subscriptions held by a single channel, keyed by the observed actor and capability.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    subscriptions: RwLock<HashMap<(ActorId, Capability), Vec<SubscriberToken>>>,
}

impl ObserverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription, returning `false` if it already existed.
    pub fn subscribe(
        &self,
        actor_id: ActorId,
        capability: Capability,
        token: SubscriberToken,
    ) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let tokens = subscriptions.entry((actor_id, capability)).or_default();
        if tokens.contains(&token) {
            return false;
        }
        tokens.push(token);
        true
    }

    /// Removes a subscription, returning `false` if it did not exist.
    pub fn unsubscribe(
        &self,
        actor_id: ActorId,
        capability: &Capability,
        token: SubscriberToken,
    ) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let key = (actor_id, capability.clone());
        let Some(tokens) = subscriptions.get_mut(&key) else {
            return false;
        };
        let Some(index) = tokens.iter().position(|existing| *existing == token) else {
            return false;
        };
        tokens.remove(index);
        if tokens.is_empty() {
            subscriptions.remove(&key);
        }
        true
    }

    /// Returns the tokens subscribed to an actor's capability.
    pub fn subscribers(&self, actor_id: ActorId, capability: &Capability) -> Vec<SubscriberToken> {
        self.subscriptions
            .read()
            .get(&(actor_id, capability.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns `true` if any capability of the actor is observed.
    pub fn is_observed(&self, actor_id: ActorId) -> bool {
        self.subscriptions
            .read()
            .keys()
            .any(|(observed, _)| *observed == actor_id)
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.subscriptions.write().clear();
    }

    /// The total number of subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.read().values().map(Vec::len).sum()
    }

    /// Returns `true` if there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IGREET_OBSERVER: Capability = Capability::from_static("IGreetObserver");

    #[test]
    fn subscribe_is_idempotent() {
        let registry = ObserverRegistry::new();
        let actor = ActorId::new(1);
        assert!(registry.subscribe(actor, IGREET_OBSERVER, SubscriberToken::new(1)));
        assert!(!registry.subscribe(actor, IGREET_OBSERVER, SubscriberToken::new(1)));
        assert!(registry.subscribe(actor, IGREET_OBSERVER, SubscriberToken::new(2)));
        assert_eq!(
            registry.subscribers(actor, &IGREET_OBSERVER),
            [SubscriberToken::new(1), SubscriberToken::new(2)]
        );
    }

    #[test]
    fn unsubscribe_removes_empty_entries() {
        let registry = ObserverRegistry::new();
        let actor = ActorId::new(1);
        registry.subscribe(actor, IGREET_OBSERVER, SubscriberToken::new(1));
        assert!(registry.is_observed(actor));

        assert!(registry.unsubscribe(actor, &IGREET_OBSERVER, SubscriberToken::new(1)));
        assert!(!registry.unsubscribe(actor, &IGREET_OBSERVER, SubscriberToken::new(1)));
        assert!(!registry.is_observed(actor));
        assert!(registry.is_empty());
    }

    #[test]
    fn subscriptions_are_per_actor() {
        let registry = ObserverRegistry::new();
        registry.subscribe(ActorId::new(1), IGREET_OBSERVER, SubscriberToken::new(1));
        assert!(registry
            .subscribers(ActorId::new(2), &IGREET_OBSERVER)
            .is_empty());
        assert_eq!(registry.len(), 1);
    }
}
