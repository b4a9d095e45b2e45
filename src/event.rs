//! Routing of actor events to the channels observing them.
//!
//! The [`EventBus`] is shared by every channel of a gateway (and may be shared across
//! gateways). Channels register as listeners for the actors their clients subscribed to, and
//! actors publish through the bus without knowing which channels, if any, are listening.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{actor::ActorId, capability::Capability, channel::ChannelId};

/// An event published by an actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorEvent {
    /// The publishing actor.
    pub actor_id: ActorId,
    /// The capability the event belongs to.
    pub capability: Capability,
    /// The encoded event.
    pub payload: Bytes,
}

/// Receives events for the actors it listens to.
pub trait EventListener: Send + Sync + 'static {
    /// Called for every event published by a listened-to actor.
    ///
    /// Must not block. Called on the publisher's task.
    fn on_event(&self, event: &ActorEvent);
}

type Listeners = HashMap<ActorId, Vec<(ChannelId, Weak<dyn EventListener>)>>;

/// Fans out actor events to listening channels.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Listeners>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel as a listener for an actor's events.
    ///
    /// Registering the same channel for the same actor again replaces the listener.
    pub fn listen(&self, actor_id: ActorId, channel_id: ChannelId, listener: Weak<dyn EventListener>) {
        let mut listeners = self.listeners.write();
        let entries = listeners.entry(actor_id).or_default();
        entries.retain(|(id, _)| *id != channel_id);
        entries.push((channel_id, listener));
    }

    /// Removes a channel's listener for an actor.
    pub fn unlisten(&self, actor_id: ActorId, channel_id: ChannelId) {
        let mut listeners = self.listeners.write();
        if let Some(entries) = listeners.get_mut(&actor_id) {
            entries.retain(|(id, _)| *id != channel_id);
            if entries.is_empty() {
                listeners.remove(&actor_id);
            }
        }
    }

    /// Removes every listener registered by a channel.
    pub fn unlisten_all(&self, channel_id: ChannelId) {
        self.listeners.write().retain(|_, entries| {
            entries.retain(|(id, _)| *id != channel_id);
            !entries.is_empty()
        });
    }

    /// Publishes an event, returning the number of listeners it was offered to.
    pub fn publish(&self, actor_id: ActorId, capability: &Capability, payload: Bytes) -> usize {
        let listeners: Vec<Arc<dyn EventListener>> = match self.listeners.read().get(&actor_id) {
            Some(entries) => entries
                .iter()
                .filter_map(|(_, listener)| listener.upgrade())
                .collect(),
            None => return 0,
        };

        let event = ActorEvent {
            actor_id,
            capability: capability.clone(),
            payload,
        };
        for listener in &listeners {
            listener.on_event(&event);
        }

        listeners.len()
    }

    /// The number of actors with at least one listener.
    pub fn observed_actors(&self) -> usize {
        self.listeners.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observed_actors", &self.observed_actors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    const IGREET_OBSERVER: Capability = Capability::from_static("IGreetObserver");

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ActorEvent>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &ActorEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn events_reach_only_listeners_of_the_actor() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn EventListener> = recorder.clone();
        bus.listen(ActorId::new(1), ChannelId::new(1), Arc::downgrade(&listener));

        assert_eq!(bus.publish(ActorId::new(2), &IGREET_OBSERVER, Bytes::new()), 0);
        assert_eq!(
            bus.publish(ActorId::new(1), &IGREET_OBSERVER, Bytes::from_static(b"hi")),
            1
        );

        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, Bytes::from_static(b"hi"));
    }

    #[test]
    fn unlisten_all_removes_a_channel_everywhere() {
        let bus = EventBus::new();
        let listener: Arc<dyn EventListener> = Arc::new(Recorder::default());
        bus.listen(ActorId::new(1), ChannelId::new(7), Arc::downgrade(&listener));
        bus.listen(ActorId::new(2), ChannelId::new(7), Arc::downgrade(&listener));
        assert_eq!(bus.observed_actors(), 2);

        bus.unlisten_all(ChannelId::new(7));
        assert_eq!(bus.observed_actors(), 0);
    }

    #[test]
    fn dropped_listeners_are_skipped() {
        let bus = EventBus::new();
        let listener: Arc<dyn EventListener> = Arc::new(Recorder::default());
        bus.listen(ActorId::new(1), ChannelId::new(1), Arc::downgrade(&listener));
        drop(listener);

        assert_eq!(bus.publish(ActorId::new(1), &IGREET_OBSERVER, Bytes::new()), 0);
    }
}
