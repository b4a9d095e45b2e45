//! Frame layout shared by every transport.
//!
//! A frame is a fixed 8 byte header followed by the codec-encoded packet body:
//!
//! ```text
//! +---------+-----------+--------------------------+------------------+
//! | kind u8 | pad [0;3] | correlation_id u32 (BE)  | body ...         |
//! +---------+-----------+--------------------------+------------------+
//! ```
//!
//! Stream transports prefix each frame with its length as a big-endian u32. Datagram
//! transports carry one frame per datagram and need no prefix.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::{CodecError, PacketCodec},
    error::DecodeError,
    packet::{CorrelationId, Packet, PacketKind},
};

/// Length of the stream transport length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Length of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 8; // kind(1) + pad(3) + correlation_id(4)

/// Largest frame accepted by default, excluding the length prefix.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The fixed header of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// The kind of the packet in the body.
    pub kind: PacketKind,
    /// The correlation id, or 0.
    pub correlation_id: CorrelationId,
}

/// Writes the fixed header of a frame.
pub fn write_frame_header(
    kind: PacketKind,
    correlation_id: CorrelationId,
) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = kind as u8;
    // header[1..4] is padding so the body starts 8-byte aligned
    header[4..8].copy_from_slice(&correlation_id.to_be_bytes());
    header
}

/// Writes the length prefix for a frame of `frame_len` bytes.
pub fn write_length_prefix(frame_len: usize) -> [u8; LENGTH_PREFIX_LEN] {
    (frame_len as u32).to_be_bytes()
}

/// Reads the header of a frame, returning it along with the body.
pub fn read_frame_header(frame: &[u8]) -> Result<(FrameHeader, &[u8]), CodecError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(CodecError::new(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }

    let kind = PacketKind::try_from(frame[0])
        .map_err(|kind| CodecError::new(format!("unknown packet kind {kind}")))?;
    let correlation_id = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

    Ok((
        FrameHeader {
            kind,
            correlation_id,
        },
        &frame[FRAME_HEADER_LEN..],
    ))
}

/// Encodes a packet into a complete frame, without length prefix.
pub fn encode_frame(codec: &dyn PacketCodec, packet: &Packet) -> Result<Bytes, CodecError> {
    let body = codec.encode(packet)?;
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_slice(&write_frame_header(packet.kind(), packet.correlation_id()));
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decodes a complete frame, without length prefix.
///
/// The error keeps the header when only the body was malformed.
pub fn decode_frame(codec: &dyn PacketCodec, frame: &[u8]) -> Result<Packet, DecodeError> {
    let (header, body) = read_frame_header(frame).map_err(|source| DecodeError {
        header: None,
        source,
    })?;

    codec
        .decode(header.kind, header.correlation_id, body)
        .map_err(|source| DecodeError {
            header: Some(header),
            source,
        })
}
