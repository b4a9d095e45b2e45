//! Signals delivered to an actor's mailbox.
//!
//! Every actor owns one bounded tokio mpsc receiver. Calls and lifecycle notifications travel
//! through the same queue, so an actor observes them in the order they were sent.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    binding::{BindingId, UnbindReason},
    channel::ChannelId,
    error::InvokeError,
    message::{Call, Origin},
};

/// Default capacity of an actor's mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

pub(crate) type MailboxSender = mpsc::Sender<Signal>;
pub(crate) type MailboxReceiver = mpsc::Receiver<Signal>;
pub(crate) type ReplySender = oneshot::Sender<Result<Bytes, InvokeError>>;

pub(crate) enum Signal {
    Invoke {
        call: Call,
        origin: Option<Origin>,
        reply: Option<ReplySender>,
    },
    Bound {
        channel_id: ChannelId,
        binding_id: BindingId,
    },
    Unbound {
        channel_id: ChannelId,
        binding_id: BindingId,
        reason: UnbindReason,
    },
    Stop,
}

pub(crate) fn bounded(capacity: usize) -> (MailboxSender, MailboxReceiver) {
    mpsc::channel(capacity.max(1))
}
