//! Packets exchanged between a gateway and a channel client.
//!
//! Every frame on the wire carries exactly one [`Packet`]. The packet kind and correlation id
//! travel in the fixed frame header (see [`framing`](crate::framing)), and the remaining fields
//! are encoded as the frame body by a [`PacketCodec`](crate::codec::PacketCodec).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    binding::{BindingId, BindingInfo},
    capability::Capability,
    channel::ChannelId,
    error::Fault,
    observer::SubscriberToken,
    session::ReconnectToken,
};

/// Matches a reply to the request it answers.
///
/// Chosen by the requesting side and unique among its outstanding requests. Packets without
/// a correlation carry 0.
pub type CorrelationId = u32;

/// The kind of a packet, as written in the frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Client to gateway: the first frame on a connection.
    Handshake = 1,
    /// Gateway to client: the channel is established.
    HandshakeAck = 2,
    /// Gateway to client: the channel was refused.
    HandshakeReject = 3,
    /// Client to gateway: a method call awaiting a reply.
    Request = 4,
    /// Gateway to client: the result of a request.
    Reply = 5,
    /// Client to gateway: a method call without a reply.
    OneWay = 6,
    /// Gateway to client: an event for a subscriber.
    Event = 7,
}

impl TryFrom<u8> for PacketKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Handshake),
            2 => Ok(PacketKind::HandshakeAck),
            3 => Ok(PacketKind::HandshakeReject),
            4 => Ok(PacketKind::Request),
            5 => Ok(PacketKind::Reply),
            6 => Ok(PacketKind::OneWay),
            7 => Ok(PacketKind::Event),
            other => Err(other),
        }
    }
}

/// Opens a channel, optionally resuming a session handed off by another gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// The reconnect token to redeem.
    pub token: Option<ReconnectToken>,
}

/// Confirms a channel and lists the bindings the client may address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    /// The id of the new channel.
    pub channel_id: ChannelId,
    /// The bindings installed on the channel.
    pub bindings: Vec<BindingInfo>,
}

/// Refuses a channel. The connection is closed after this packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReject {
    /// Why the channel was refused.
    pub reason: String,
}

/// A method call on a binding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// The targeted binding.
    pub binding_id: BindingId,
    /// The capability the method belongs to.
    pub capability: Capability,
    /// The method selector.
    pub method: String,
    /// The encoded arguments.
    pub args: Bytes,
}

/// An event published by a bound actor, addressed to one subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The subscriber the event is for.
    pub subscriber_token: SubscriberToken,
    /// The encoded event.
    pub payload: Bytes,
}

/// A single unit of traffic on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// See [`Handshake`].
    Handshake(Handshake),
    /// See [`HandshakeAck`].
    HandshakeAck(HandshakeAck),
    /// See [`HandshakeReject`].
    HandshakeReject(HandshakeReject),
    /// A request awaiting a reply with the same correlation id.
    Request {
        /// Chosen by the client.
        correlation_id: CorrelationId,
        /// The call.
        request: Request,
    },
    /// The result of the request with the same correlation id.
    Reply {
        /// Copied from the request.
        correlation_id: CorrelationId,
        /// The encoded return value, or why there is none.
        result: Result<Bytes, Fault>,
    },
    /// A call which is not answered.
    OneWay(Request),
    /// See [`Event`].
    Event(Event),
}

impl Packet {
    /// Returns the packet's kind.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake(_) => PacketKind::Handshake,
            Packet::HandshakeAck(_) => PacketKind::HandshakeAck,
            Packet::HandshakeReject(_) => PacketKind::HandshakeReject,
            Packet::Request { .. } => PacketKind::Request,
            Packet::Reply { .. } => PacketKind::Reply,
            Packet::OneWay(_) => PacketKind::OneWay,
            Packet::Event(_) => PacketKind::Event,
        }
    }

    /// Returns the packet's correlation id, or 0 if it is not correlated.
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Packet::Request { correlation_id, .. } | Packet::Reply { correlation_id, .. } => {
                *correlation_id
            }
            _ => 0,
        }
    }
}
