use std::fmt;

use bytes::Bytes;
use tokio::sync::{mpsc::error::TrySendError, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    error::InvokeError,
    mailbox::{MailboxSender, Signal},
    message::{Call, Origin},
};

use super::ActorId;

/// A reference to a running actor.
///
/// `ActorRef` is cheap to clone. It is the only way to reach an actor: calls are enqueued on
/// the actor's mailbox and handled in order. The actor keeps running while at least one
/// reference exists and it has not been stopped.
#[derive(Clone)]
pub struct ActorRef {
    id: ActorId,
    name: &'static str,
    mailbox: MailboxSender,
    stopped: CancellationToken,
}

impl ActorRef {
    pub(crate) fn new(
        id: ActorId,
        name: &'static str,
        mailbox: MailboxSender,
        stopped: CancellationToken,
    ) -> Self {
        ActorRef {
            id,
            name,
            mailbox,
            stopped,
        }
    }

    /// Returns the unique identifier of the actor.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Returns the name of the actor.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns whether the actor is currently alive.
    pub fn is_alive(&self) -> bool {
        !self.stopped.is_cancelled() && !self.mailbox.is_closed()
    }

    /// Invokes the actor and waits for its reply.
    ///
    /// The call is handled as a local call, without a channel in its [`Context`](crate::message::Context).
    pub async fn invoke(&self, call: Call) -> Result<Bytes, InvokeError> {
        self.invoke_from(call, None).await
    }

    /// Enqueues a call without waiting for it to be handled.
    ///
    /// Resolves once the call has been accepted by the mailbox.
    pub async fn tell(&self, call: Call) -> Result<(), InvokeError> {
        self.tell_from(call, None).await
    }

    /// Enqueues a call without waiting for mailbox capacity.
    pub fn try_tell(&self, call: Call) -> Result<(), InvokeError> {
        self.mailbox
            .try_send(Signal::Invoke {
                call,
                origin: None,
                reply: None,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => InvokeError::MailboxFull,
                TrySendError::Closed(_) => InvokeError::ActorStopped,
            })
    }

    /// Signals the actor to stop after handling the calls already in its mailbox.
    ///
    /// Stopping an actor which has already stopped does nothing.
    pub async fn stop(&self) {
        let _ = self.mailbox.send(Signal::Stop).await;
    }

    /// Waits for the actor to finish stopping.
    pub async fn wait_for_stop(&self) {
        self.stopped.cancelled().await
    }

    pub(crate) async fn invoke_from(
        &self,
        call: Call,
        origin: Option<Origin>,
    ) -> Result<Bytes, InvokeError> {
        self.enqueue(call, origin)
            .await?
            .await
            .map_err(|_| InvokeError::ActorStopped)?
    }

    /// Enqueues a call, returning a receiver for its reply.
    pub(crate) async fn enqueue(
        &self,
        call: Call,
        origin: Option<Origin>,
    ) -> Result<oneshot::Receiver<Result<Bytes, InvokeError>>, InvokeError> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(Signal::Invoke {
                call,
                origin,
                reply: Some(reply),
            })
            .await
            .map_err(|_| InvokeError::ActorStopped)?;
        Ok(rx)
    }

    pub(crate) async fn tell_from(
        &self,
        call: Call,
        origin: Option<Origin>,
    ) -> Result<(), InvokeError> {
        self.mailbox
            .send(Signal::Invoke {
                call,
                origin,
                reply: None,
            })
            .await
            .map_err(|_| InvokeError::ActorStopped)
    }

    /// Delivers a signal only if the mailbox has room for it.
    pub(crate) fn try_deliver(&self, signal: Signal) -> Result<(), TrySendError<Signal>> {
        self.mailbox.try_send(signal)
    }

    /// Delivers a signal, waiting for room in the mailbox.
    pub(crate) async fn deliver(&self, signal: Signal) -> Result<(), InvokeError> {
        self.mailbox
            .send(signal)
            .await
            .map_err(|_| InvokeError::ActorStopped)
    }

    pub(crate) fn stopped_token(&self) -> CancellationToken {
        self.stopped.clone()
    }

    /// Delivers a lifecycle signal without blocking the caller.
    ///
    /// When the mailbox is full the signal is sent from a background task.
    pub(crate) fn signal_detached(&self, signal: Signal) {
        match self.mailbox.try_send(signal) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(signal)) => {
                let mailbox = self.mailbox.clone();
                tokio::spawn(async move {
                    let _ = mailbox.send(signal).await;
                });
            }
        }
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActorRef {}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
