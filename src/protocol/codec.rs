//! Protocol codec for encoding/decoding datagrams
//!
//! Handles serialization and framing of packets. A datagram holds exactly
//! one frame, so decoding is stateless.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::{Packet, MAGIC_BYTES};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Header size: magic(4) + type(1) + length(4) + sequence(4) = 13 bytes
pub const HEADER_SIZE: usize = 13;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Datagram too large: {0} bytes (max: {1})")]
    DatagramTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Incomplete datagram: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },

    #[error("Packet type mismatch: header says {header:#04x}, payload is {payload:#04x}")]
    TypeMismatch { header: u8, payload: u8 },
}

/// Decoded datagram with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender-local sequence number
    pub sequence: u32,
    /// The actual packet
    pub packet: Packet,
}

impl Frame {
    pub fn new(sequence: u32, packet: Packet) -> Self {
        Self { sequence, packet }
    }
}

/// Encodes packets into the wire format
pub struct Encoder {
    sequence: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Encode a packet into a buffer, stamping the next sequence number
    pub fn encode(&mut self, packet: &Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(packet)?;

        let total = HEADER_SIZE + payload.len();
        if total > MAX_DATAGRAM_SIZE {
            return Err(CodecError::DatagramTooLarge(total, MAX_DATAGRAM_SIZE));
        }

        buf.reserve(total);
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(packet.type_id());
        buf.put_u32(payload.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&payload);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Sequence number the next encoded packet will carry
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a single datagram
pub fn decode(datagram: &[u8]) -> Result<Frame, CodecError> {
    if datagram.len() < HEADER_SIZE {
        return Err(CodecError::Incomplete {
            expected: HEADER_SIZE,
            actual: datagram.len(),
        });
    }
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::DatagramTooLarge(datagram.len(), MAX_DATAGRAM_SIZE));
    }
    if datagram[0..4] != MAGIC_BYTES {
        return Err(CodecError::InvalidMagic);
    }

    let packet_type = datagram[4];
    let length = u32::from_be_bytes([datagram[5], datagram[6], datagram[7], datagram[8]]) as usize;
    let sequence = u32::from_be_bytes([datagram[9], datagram[10], datagram[11], datagram[12]]);

    let body = &datagram[HEADER_SIZE..];
    if body.len() != length {
        return Err(CodecError::Incomplete {
            expected: HEADER_SIZE + length,
            actual: datagram.len(),
        });
    }

    let packet: Packet = bincode::deserialize(body)?;
    if packet.type_id() != packet_type {
        return Err(CodecError::TypeMismatch {
            header: packet_type,
            payload: packet.type_id(),
        });
    }

    Ok(Frame::new(sequence, packet))
}
