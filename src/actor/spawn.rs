use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use crate::{
    error::InvokeError,
    mailbox::{self, MailboxReceiver, Signal},
    message::Context,
};

use super::{Actor, ActorId, ActorRef};

/// Spawns an actor in a tokio task, returning a reference to it.
///
/// The actor handles calls sequentially until it is stopped with [`ActorRef::stop`], every
/// reference to it has been dropped, or one of its handlers panics.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub fn spawn<A: Actor>(actor: A) -> ActorRef {
    let (mailbox, mailbox_rx) = mailbox::bounded(A::mailbox_capacity());
    let stopped = CancellationToken::new();
    let actor_ref = ActorRef::new(ActorId::generate(), A::name(), mailbox, stopped.clone());

    tokio::spawn(run_actor_lifecycle(actor, actor_ref.id(), mailbox_rx, stopped));

    actor_ref
}

async fn run_actor_lifecycle<A: Actor>(
    mut actor: A,
    id: ActorId,
    mut mailbox_rx: MailboxReceiver,
    stopped: CancellationToken,
) {
    let name = A::name();
    trace!(%id, %name, "actor started");

    let panicked = run_actor_loop(&mut actor, id, &mut mailbox_rx).await;
    mailbox_rx.close();

    if panicked {
        error!(%id, %name, "actor stopped after a handler panicked");
    } else {
        actor.on_stop().await;
        trace!(%id, %name, "actor stopped");
    }

    stopped.cancel();
}

/// Returns `true` if the loop ended because a handler panicked.
async fn run_actor_loop<A: Actor>(
    actor: &mut A,
    id: ActorId,
    mailbox_rx: &mut MailboxReceiver,
) -> bool {
    while let Some(signal) = mailbox_rx.recv().await {
        match signal {
            Signal::Invoke {
                call,
                origin,
                reply,
            } => {
                let method = call.method.clone();
                let ctx = Context::new(id, origin);
                let res = match AssertUnwindSafe(actor.handle(call, ctx))
                    .catch_unwind()
                    .await
                {
                    Ok(res) => res.map_err(InvokeError::Handler),
                    Err(_) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(InvokeError::ActorStopped));
                        }
                        return true;
                    }
                };

                match reply {
                    Some(reply) => {
                        let _ = reply.send(res);
                    }
                    None => {
                        if let Err(err) = res {
                            warn!(%id, %method, %err, "one-way call failed");
                        }
                    }
                }
            }
            Signal::Bound {
                channel_id,
                binding_id,
            } => actor.on_bound(channel_id, binding_id).await,
            Signal::Unbound {
                channel_id,
                binding_id,
                reason,
            } => actor.on_unbound(channel_id, binding_id, reason).await,
            Signal::Stop => break,
        }
    }

    false
}
