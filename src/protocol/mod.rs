//! Protocol module - Wire format used by the UDP messaging backend
//!
//! Every datagram carries exactly one frame:
//! - 4 bytes magic
//! - 1 byte packet type
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - bincode-encoded payload

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default UDP port
pub const DEFAULT_PORT: u16 = 27015;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x50, 0x4C, 0x4E, 0x4B]; // "PLNK"
