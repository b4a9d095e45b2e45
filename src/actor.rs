//! Core functionality for defining the actors which a gateway exposes to remote clients.
//!
//! An actor is a unit of sequential state. It owns its data, receives [`Call`]s through a
//! bounded mailbox, and handles them one at a time, so handlers never need locks. The gateway
//! never calls into an actor directly; it only holds an [`ActorRef`] and enqueues calls.
//!
//! Actors are started with [`spawn`], which runs them on a tokio task and returns an
//! [`ActorRef`]. The same reference may be bound on any number of channels, and the actor is
//! told about binding changes through [`Actor::on_bound`] and [`Actor::on_unbound`] when the
//! binding asks for it with [`BindingFlags`](crate::binding::BindingFlags).
//!
//! ```
//! use bytes::Bytes;
//! use kameo_gateway::actor::{spawn, Actor};
//! use kameo_gateway::message::{Call, Context};
//!
//! #[derive(Default)]
//! struct Counter {
//!     count: i64,
//! }
//!
//! impl Actor for Counter {
//!     async fn handle(&mut self, call: Call, _ctx: Context) -> anyhow::Result<Bytes> {
//!         match call.method.as_str() {
//!             "IncCounter" => {
//!                 self.count += call.args::<i64>()?;
//!                 Ok(Bytes::new())
//!             }
//!             method => anyhow::bail!("unhandled method {method}"),
//!         }
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let counter = spawn(Counter::default());
//! # });
//! ```

mod actor_ref;
mod id;
mod spawn;

use std::any;

use bytes::Bytes;
use futures::Future;

use crate::{
    binding::{BindingId, UnbindReason},
    channel::ChannelId,
    mailbox::DEFAULT_MAILBOX_CAPACITY,
    message::{Call, Context},
};

pub use actor_ref::*;
pub use id::*;
pub use spawn::*;

/// Core behaviour of an actor which can be bound on a channel.
///
/// Only [`Actor::handle`] is required. Every other method has a default.
pub trait Actor: Sized + Send + 'static {
    /// The name of the actor, which can be useful for logging or debugging.
    ///
    /// # Default Implementation
    ///
    /// By default, this returns the type name of the actor.
    fn name() -> &'static str {
        any::type_name::<Self>()
    }

    /// The capacity of the actor's bounded mailbox.
    fn mailbox_capacity() -> usize {
        DEFAULT_MAILBOX_CAPACITY
    }

    /// Handles a single call.
    ///
    /// The returned bytes are the encoded return value. Requests send them back to the caller
    /// inside a reply, while one-way calls discard them. Returning an error produces a
    /// [`FaultKind::Handler`](crate::error::FaultKind::Handler) fault for the caller.
    fn handle(
        &mut self,
        call: Call,
        ctx: Context,
    ) -> impl Future<Output = anyhow::Result<Bytes>> + Send;

    /// Called when the actor has been bound on a channel with
    /// [`BindingFlags::NOTIFY_ON_BIND`](crate::binding::BindingFlags::NOTIFY_ON_BIND).
    #[allow(unused_variables)]
    fn on_bound(
        &mut self,
        channel_id: ChannelId,
        binding_id: BindingId,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when a binding with
    /// [`BindingFlags::NOTIFY_ON_UNBIND`](crate::binding::BindingFlags::NOTIFY_ON_UNBIND)
    /// has been released.
    #[allow(unused_variables)]
    fn on_unbound(
        &mut self,
        channel_id: ChannelId,
        binding_id: BindingId,
        reason: UnbindReason,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called once after the actor has stopped processing its mailbox.
    ///
    /// This is not called if the actor stopped because a handler panicked.
    fn on_stop(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
