//! Pluggable codecs for packet bodies and call payloads.
//!
//! The [`PacketCodec`] trait abstracts over the serialization used for the body of each frame.
//! Gateways and clients hold it as `Arc<dyn PacketCodec>`, so both sides of a connection must be
//! configured with compatible codecs. [`MsgPackCodec`] is the default and encodes bodies with
//! MessagePack through `rmp-serde`.
//!
//! Method arguments, return values and event payloads are opaque [`Bytes`] to the gateway. The
//! [`to_payload`] and [`from_payload`] helpers encode them with the same MessagePack format.

use std::{error, fmt, sync::Arc};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::packet::{CorrelationId, Packet, PacketKind};

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// An error that occurs during codec encode/decode operations.
///
/// Wraps an [`anyhow::Error`] for flexible error propagation while
/// implementing the standard [`Error`](error::Error) trait.
pub struct CodecError(anyhow::Error);

impl CodecError {
    /// Create a new codec error from any displayable value.
    pub fn new(err: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        CodecError(anyhow::Error::msg(err))
    }

    /// Consumes the error and returns the inner [`anyhow::Error`].
    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl error::Error for CodecError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

impl From<String> for CodecError {
    fn from(s: String) -> Self {
        CodecError(anyhow::anyhow!("{s}"))
    }
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CodecError(err.into())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CodecError(err.into())
    }
}

// ---------------------------------------------------------------------------
// PacketCodec
// ---------------------------------------------------------------------------

/// Encodes and decodes the body of a frame.
///
/// The frame header already carries the packet kind and correlation id, so implementations
/// only serialize the remaining fields.
pub trait PacketCodec: fmt::Debug + Send + Sync + 'static {
    /// Encodes the body of a packet.
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError>;

    /// Decodes a packet from its header fields and body.
    fn decode(
        &self,
        kind: PacketKind,
        correlation_id: CorrelationId,
        body: &[u8],
    ) -> Result<Packet, CodecError>;
}

/// A shared codec.
pub type SharedCodec = Arc<dyn PacketCodec>;

/// Encodes packet bodies as MessagePack maps.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackCodec;

impl PacketCodec for MsgPackCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let body = match packet {
            Packet::Handshake(handshake) => rmp_serde::to_vec_named(handshake)?,
            Packet::HandshakeAck(ack) => rmp_serde::to_vec_named(ack)?,
            Packet::HandshakeReject(reject) => rmp_serde::to_vec_named(reject)?,
            Packet::Request { request, .. } | Packet::OneWay(request) => {
                rmp_serde::to_vec_named(request)?
            }
            Packet::Reply { result, .. } => rmp_serde::to_vec_named(result)?,
            Packet::Event(event) => rmp_serde::to_vec_named(event)?,
        };

        Ok(body)
    }

    fn decode(
        &self,
        kind: PacketKind,
        correlation_id: CorrelationId,
        body: &[u8],
    ) -> Result<Packet, CodecError> {
        let packet = match kind {
            PacketKind::Handshake => Packet::Handshake(rmp_serde::from_slice(body)?),
            PacketKind::HandshakeAck => Packet::HandshakeAck(rmp_serde::from_slice(body)?),
            PacketKind::HandshakeReject => Packet::HandshakeReject(rmp_serde::from_slice(body)?),
            PacketKind::Request => Packet::Request {
                correlation_id,
                request: rmp_serde::from_slice(body)?,
            },
            PacketKind::Reply => Packet::Reply {
                correlation_id,
                result: rmp_serde::from_slice(body)?,
            },
            PacketKind::OneWay => Packet::OneWay(rmp_serde::from_slice(body)?),
            PacketKind::Event => Packet::Event(rmp_serde::from_slice(body)?),
        };

        Ok(packet)
    }
}

/// Encodes a call argument, return value or event payload.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?.into())
}

/// Decodes a call argument, return value or event payload.
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use crate::{
        binding::BindingId,
        capability::Capability,
        error::{Fault, FaultKind},
        packet::Request,
    };

    use super::*;

    #[test]
    fn faults_survive_encoding() {
        let codec = MsgPackCodec;
        let packet = Packet::Reply {
            correlation_id: 3,
            result: Err(Fault::new(FaultKind::UnknownBinding, "unknown binding #4")),
        };
        let body = codec.encode(&packet).unwrap();
        let decoded = codec.decode(PacketKind::Reply, 3, &body).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn correlation_comes_from_the_header() {
        let codec = MsgPackCodec;
        let body = codec
            .encode(&Packet::Request {
                correlation_id: 1,
                request: Request {
                    binding_id: BindingId::new(1),
                    capability: Capability::from_static("IGreeter"),
                    method: "Greet".to_string(),
                    args: to_payload("World").unwrap(),
                },
            })
            .unwrap();

        let decoded = codec.decode(PacketKind::Request, 77, &body).unwrap();
        assert_eq!(decoded.correlation_id(), 77);
    }

    #[test]
    fn garbage_body_is_a_codec_error() {
        let codec = MsgPackCodec;
        assert!(codec.decode(PacketKind::Request, 1, &[0xc1, 0xff]).is_err());
    }

    #[test]
    fn payload_helpers() {
        let payload = to_payload(&(1i32, "two")).unwrap();
        let (a, b): (i32, String) = from_payload(&payload).unwrap();
        assert_eq!((a, b.as_str()), (1, "two"));
        assert!(from_payload::<String>(&to_payload(&5u8).unwrap()).is_err());
    }
}
