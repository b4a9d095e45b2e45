//! Defines error handling constructs for kameo_gateway.
//!
//! Errors are grouped by the layer that raises them. Transport and start-up failures
//! ([`GatewayError`], [`HandshakeError`]) are fatal to the attempt that raised them, while
//! per-request failures ([`ChannelError`], [`InvokeError`]) are converted into a [`Fault`] and
//! sent back to the remote caller inside a reply, leaving the channel open.

use std::{error, fmt, io, net::SocketAddr};

use serde::{Deserialize, Serialize};

use crate::{
    actor::ActorId,
    binding::BindingId,
    capability::Capability,
    channel::ChannelId,
    codec::CodecError,
    framing::FrameHeader,
    packet::{CorrelationId, PacketKind},
    transport::TransportKind,
};

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Error that can occur when starting or stopping a [`Gateway`](crate::gateway::Gateway).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The listen endpoint could not be bound (address in use, permission denied).
    #[error("failed to bind {transport} gateway on {addr}: {source}")]
    Bind {
        /// The endpoint that was requested.
        addr: SocketAddr,
        /// The transport that was being bound.
        transport: TransportKind,
        /// The underlying io error.
        #[source]
        source: io::Error,
    },
    /// The gateway configuration is not usable.
    #[error("invalid gateway configuration: {0}")]
    Config(String),
    /// Some channels did not drain their in-flight requests before the shutdown deadline.
    ///
    /// These channels were still closed forcibly.
    #[error("{} channel(s) did not drain before the shutdown deadline", .channels.len())]
    ShutdownTimedOut {
        /// The channels which had to be closed forcibly.
        channels: Vec<ChannelId>,
    },
}

/// A reconnect token could not be redeemed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The gateway requires a token but none was presented.
    #[error("reconnect token is missing")]
    Missing,
    /// The token was never issued, was revoked, or has already been used.
    #[error("reconnect token is unknown or already used")]
    Unknown,
    /// The token was issued but its time to live has passed.
    #[error("reconnect token has expired")]
    Expired,
}

/// Error that can occur while establishing a channel on a new connection.
///
/// No channel exists when this error is returned; the connection has been closed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The presented reconnect token was missing, unknown or expired.
    #[error("invalid reconnect token: {0}")]
    InvalidToken(#[from] TokenError),
    /// The peer did not complete the handshake within the configured window.
    #[error("handshake timed out")]
    Timeout,
    /// The first frame was not the expected handshake packet.
    #[error("expected a handshake, got {0:?}")]
    UnexpectedPacket(PacketKind),
    /// The connection closed before the handshake completed.
    #[error("connection closed during handshake")]
    ConnectionClosed,
    /// The remote gateway rejected the handshake.
    #[error("handshake rejected: {reason}")]
    Rejected {
        /// Reason given by the gateway.
        reason: String,
    },
    /// The initial-binding factory failed, or a produced binding could not be installed.
    #[error("failed to install initial bindings: {0}")]
    InitialBindings(BoxError),
    /// The gateway was stopped while the handshake was in progress.
    #[error("gateway is stopped")]
    GatewayStopped,
    /// The handshake frame could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A handshake frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// An io error on the underlying connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error returned by operations on a [`Channel`](crate::channel::Channel).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The actor is already bound on this channel under an identical capability set.
    #[error("actor {actor_id} is already bound as {existing} with the same capabilities")]
    DuplicateBinding {
        /// The actor which was bound twice.
        actor_id: ActorId,
        /// The binding that already exists.
        existing: BindingId,
    },
    /// No binding exists with the given id on this channel.
    #[error("unknown binding {0}")]
    UnknownBinding(BindingId),
    /// The binding exists but does not expose the requested capability.
    #[error("binding {binding_id} does not expose capability '{capability}'")]
    CapabilityMismatch {
        /// The targeted binding.
        binding_id: BindingId,
        /// The capability which was requested.
        capability: Capability,
    },
    /// The capability was never registered in the catalog.
    #[error("capability '{0}' is not registered")]
    UnknownCapability(Capability),
    /// The capability does not declare the requested method.
    #[error("capability '{capability}' has no method '{method}'")]
    UnknownMethod {
        /// The requested capability.
        capability: Capability,
        /// The requested method selector.
        method: String,
    },
    /// Every binding id of the channel has been allocated.
    #[error("binding ids are exhausted")]
    BindingIdsExhausted,
    /// The channel has been closed.
    #[error("channel is closed")]
    Closed,
    /// The underlying connection failed.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
}

/// Error that can occur when invoking an actor.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The actor has stopped, or stopped before a reply could be produced.
    #[error("actor stopped")]
    ActorStopped,
    /// The actor's mailbox is full.
    #[error("actor mailbox full")]
    MailboxFull,
    /// The actor's handler returned an error.
    #[error("{0:#}")]
    Handler(anyhow::Error),
}

/// Error that can occur when building a [`CapabilityCatalog`](crate::capability::CapabilityCatalog).
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Two interfaces were registered under the same capability name.
    #[error("interface '{0}' registered more than once")]
    DuplicateInterface(Capability),
}

/// A frame which could not be turned into a packet.
///
/// If the fixed frame header could be read, it is kept so that request traffic can still be
/// answered with a fault carrying the original correlation id.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {source}")]
pub struct DecodeError {
    /// The frame header, if it was readable.
    pub header: Option<FrameHeader>,
    /// What went wrong.
    #[source]
    pub source: CodecError,
}

impl DecodeError {
    /// Returns the correlation id to answer, if the malformed frame was a request.
    pub fn request_correlation(&self) -> Option<CorrelationId> {
        self.header
            .filter(|header| header.kind == PacketKind::Request)
            .map(|header| header.correlation_id)
    }
}

/// Error returned by a [`ChannelClient`](crate::client::ChannelClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The gateway answered the request with a fault.
    #[error(transparent)]
    Fault(#[from] Fault),
    /// The channel closed before a reply arrived.
    #[error("channel closed")]
    Closed,
    /// No reply arrived within the request timeout.
    #[error("request timed out")]
    Timeout,
    /// The handshake with the gateway failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// A payload or packet could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// An io error on the underlying connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The category of a [`Fault`] returned in place of a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// The request targeted a binding id which is not bound on the channel.
    UnknownBinding,
    /// The binding does not expose the requested capability.
    CapabilityMismatch,
    /// The capability does not declare the requested method.
    UnknownMethod,
    /// The actor is already bound with the same capabilities.
    DuplicateBinding,
    /// The request frame could not be decoded.
    Decode,
    /// The actor's handler returned an error.
    Handler,
    /// The actor stopped before replying.
    ActorStopped,
    /// The actor's mailbox was full.
    MailboxFull,
    /// The channel closed before the request could be handled.
    ChannelClosed,
    /// The encoded reply exceeded the connection's frame limit.
    FrameTooLarge,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::UnknownBinding => write!(f, "unknown binding"),
            FaultKind::CapabilityMismatch => write!(f, "capability mismatch"),
            FaultKind::UnknownMethod => write!(f, "unknown method"),
            FaultKind::DuplicateBinding => write!(f, "duplicate binding"),
            FaultKind::Decode => write!(f, "decode error"),
            FaultKind::Handler => write!(f, "handler error"),
            FaultKind::ActorStopped => write!(f, "actor stopped"),
            FaultKind::MailboxFull => write!(f, "mailbox full"),
            FaultKind::ChannelClosed => write!(f, "channel closed"),
            FaultKind::FrameTooLarge => write!(f, "frame too large"),
        }
    }
}

/// A failed request, sent back to the caller in place of a result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// What kind of failure occurred.
    pub kind: FaultKind,
    /// A human readable description.
    pub message: String,
}

impl Fault {
    /// Creates a new fault.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Fault {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl error::Error for Fault {}

impl ChannelError {
    /// The kind of fault reported to a caller whose request failed with this error.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            ChannelError::DuplicateBinding { .. } => FaultKind::DuplicateBinding,
            ChannelError::UnknownBinding(_) => FaultKind::UnknownBinding,
            ChannelError::CapabilityMismatch { .. } | ChannelError::UnknownCapability(_) => {
                FaultKind::CapabilityMismatch
            }
            ChannelError::UnknownMethod { .. } => FaultKind::UnknownMethod,
            ChannelError::BindingIdsExhausted => FaultKind::Handler,
            ChannelError::Closed | ChannelError::Transport(_) => FaultKind::ChannelClosed,
        }
    }
}

impl From<ChannelError> for Fault {
    fn from(err: ChannelError) -> Self {
        Fault::new(err.fault_kind(), err.to_string())
    }
}

impl From<InvokeError> for Fault {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::ActorStopped => Fault::new(FaultKind::ActorStopped, ""),
            InvokeError::MailboxFull => Fault::new(FaultKind::MailboxFull, ""),
            InvokeError::Handler(err) => {
                // channel errors raised inside a handler keep their kind
                let kind = err
                    .downcast_ref::<ChannelError>()
                    .map_or(FaultKind::Handler, ChannelError::fault_kind);
                Fault::new(kind, format!("{err:#}"))
            }
        }
    }
}

impl From<&DecodeError> for Fault {
    fn from(err: &DecodeError) -> Self {
        Fault::new(FaultKind::Decode, err.source.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_map_to_fault_kinds() {
        let fault = Fault::from(ChannelError::UnknownBinding(BindingId::new(7)));
        assert_eq!(fault.kind, FaultKind::UnknownBinding);
        assert!(fault.message.contains("#7"));

        let fault = Fault::from(ChannelError::CapabilityMismatch {
            binding_id: BindingId::new(1),
            capability: Capability::from_static("ICounter"),
        });
        assert_eq!(fault.kind, FaultKind::CapabilityMismatch);

        let fault = Fault::from(ChannelError::Closed);
        assert_eq!(fault.kind, FaultKind::ChannelClosed);
    }

    #[test]
    fn handler_errors_keep_their_message() {
        let fault = Fault::from(InvokeError::Handler(anyhow::anyhow!("division by zero")));
        assert_eq!(fault.kind, FaultKind::Handler);
        assert_eq!(fault.message, "division by zero");
        assert_eq!(fault.to_string(), "handler error: division by zero");
    }

    #[test]
    fn channel_errors_raised_by_handlers_keep_their_kind() {
        let err = anyhow::Error::from(ChannelError::DuplicateBinding {
            actor_id: ActorId::new(3),
            existing: BindingId::new(2),
        });
        let fault = Fault::from(InvokeError::Handler(err.context("binding the counter")));
        assert_eq!(fault.kind, FaultKind::DuplicateBinding);
        assert!(fault.message.starts_with("binding the counter"));
    }

    #[test]
    fn empty_fault_message_displays_kind_only() {
        assert_eq!(
            Fault::new(FaultKind::ActorStopped, "").to_string(),
            "actor stopped"
        );
    }

    #[test]
    fn decode_error_only_answers_requests() {
        let request = DecodeError {
            header: Some(FrameHeader {
                kind: PacketKind::Request,
                correlation_id: 42,
            }),
            source: CodecError::new("truncated body"),
        };
        assert_eq!(request.request_correlation(), Some(42));

        let one_way = DecodeError {
            header: Some(FrameHeader {
                kind: PacketKind::OneWay,
                correlation_id: 0,
            }),
            source: CodecError::new("truncated body"),
        };
        assert_eq!(one_way.request_correlation(), None);

        let headerless = DecodeError {
            header: None,
            source: CodecError::new("short frame"),
        };
        assert_eq!(headerless.request_correlation(), None);
    }
}
