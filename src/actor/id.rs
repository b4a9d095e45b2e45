use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

static ACTOR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-wide unique identifier for an actor.
///
/// Identifiers are assigned sequentially in spawn order and are never reused. They identify
/// actors within the binding and observer registries, and key event subscriptions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(u64);

impl ActorId {
    /// Creates a new `ActorId` with the given `sequence_id`.
    pub const fn new(sequence_id: u64) -> Self {
        ActorId(sequence_id)
    }

    /// Generates a new `ActorId` with an automatically incremented `sequence_id`.
    ///
    /// Uses an atomic counter to ensure unique `sequence_id` values across threads.
    pub fn generate() -> Self {
        ActorId::new(ACTOR_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the sequential identifier of the actor.
    ///
    /// The first spawned actor gets id 0, the second 1, and so on.
    pub fn sequence_id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_increasing() {
        let a = ActorId::generate();
        let b = ActorId::generate();
        assert_ne!(a, b);
        assert!(b.sequence_id() > a.sequence_id());
    }

    #[test]
    fn display_and_debug() {
        let id = ActorId::new(12);
        assert_eq!(id.to_string(), "12");
        assert_eq!(format!("{id:?}"), "ActorId(12)");
    }
}
