//! Messaging module - The raw peer-to-peer primitive underneath the transport
//!
//! Provides:
//! - Address and socket-name value types
//! - The `PeerMessagingService` trait and the callbacks it drives
//! - An in-process loopback backend and a UDP backend

mod address;
mod link;
mod loopback;
mod udp;

#[cfg(test)]
pub(crate) mod mock;

pub use address::*;
pub use link::*;
pub use loopback::*;
pub use udp::*;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Messaging service errors
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::CodecError),

    #[error("Messaging service already initialized")]
    AlreadyInitialized,

    #[error("Address already in use: {0}")]
    AddressInUse(PeerAddress),
}

pub type MessagingResult<T> = Result<T, MessagingError>;

/// Delivery contract requested per message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Reliability {
    UnreliableUnordered = 0,
    ReliableUnordered = 1,
    ReliableOrdered = 2,
}

impl Reliability {
    pub fn is_reliable(self) -> bool {
        !matches!(self, Reliability::UnreliableUnordered)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered)
    }

    /// Whether a payload above the service's packet limit may be handed
    /// down. Only the ordered tier is fragmented downstream.
    pub fn allows_oversized(self) -> bool {
        self.is_ordered()
    }
}

/// A packet pulled off the messaging service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub peer: PeerAddress,
    pub socket: SocketName,
    pub channel: u8,
    pub payload: Bytes,
}

/// Notifications a messaging service delivers about connection progress.
///
/// Implementations may be invoked from the service's own execution context
/// and must not block.
pub trait MessagingCallbacks: Send + Sync {
    /// A remote peer asked to open `socket` with us
    fn on_incoming_connection_requested(&self, peer: &PeerAddress, socket: &SocketName);

    /// Both halves of the handshake for `(peer, socket)` are complete
    fn on_connection_opened(&self, peer: &PeerAddress, socket: &SocketName);

    /// The connection for `(peer, socket)` was torn down by the remote side
    fn on_connection_closed(&self, peer: &PeerAddress, socket: &SocketName);
}

/// Point-to-point send/receive primitive the transport is layered on.
///
/// Accepting an incoming request is done by calling `open_connection` for
/// the requesting peer; rejecting it by closing with `notify_remote`.
pub trait PeerMessagingService: Send + Sync {
    /// Register callbacks and bring the service up
    fn initialize(&self, callbacks: Arc<dyn MessagingCallbacks>) -> MessagingResult<()>;

    /// Address other peers use to reach this one
    fn local_address(&self) -> PeerAddress;

    /// Largest payload accepted in a single packet
    fn max_packet_size(&self) -> usize;

    /// Start (or accept) a handshake. Returns false if it could not be initiated.
    fn open_connection(&self, peer: &PeerAddress, socket: &SocketName) -> bool;

    /// Tear a connection down, optionally telling the remote side
    fn close_connection(&self, peer: &PeerAddress, socket: &SocketName, notify_remote: bool);

    /// Hand a packet to the service. Returns false if it was not accepted.
    fn send_packet(
        &self,
        peer: &PeerAddress,
        socket: &SocketName,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> bool;

    /// Pop the next received packet without blocking
    fn try_receive_packet(&self) -> Option<ReceivedPacket>;

    /// Close everything and drop the registered callbacks
    fn shutdown(&self);
}
