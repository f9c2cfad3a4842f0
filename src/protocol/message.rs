//! Packet definitions
//!
//! Packets exchanged between UDP messaging endpoints.

use serde::{Deserialize, Serialize};

use crate::messaging::{Reliability, SocketName};

/// All packets understood by the UDP backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Sender opened (or accepted) its half of a socket
    Open {
        socket: SocketName,
    },

    /// Sender tore the socket down
    Close {
        socket: SocketName,
    },

    /// Application payload
    Data {
        socket: SocketName,
        channel: u8,
        reliability: Reliability,
        payload: Vec<u8>,
    },
}

impl Packet {
    /// Get the packet type identifier
    pub fn type_id(&self) -> u8 {
        match self {
            Packet::Open { .. } => 0x01,
            Packet::Close { .. } => 0x02,
            Packet::Data { .. } => 0x10,
        }
    }

    pub fn socket(&self) -> &SocketName {
        match self {
            Packet::Open { socket }
            | Packet::Close { socket }
            | Packet::Data { socket, .. } => socket,
        }
    }
}
