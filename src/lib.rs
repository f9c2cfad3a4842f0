//! PeerLink - Connection-oriented transport over peer-to-peer messaging
//!
//! Layers client/server sessions, stable client ids and a polled event
//! stream on top of a raw P2P messaging primitive that only knows peer
//! addresses, named sockets and per-packet reliability.

pub mod config;
pub mod messaging;
pub mod protocol;
pub mod transport;

pub use messaging::{PeerAddress, PeerMessagingService, Reliability, SocketName};
pub use transport::{
    ClientId, Transport, TransportConfig, TransportError, TransportEvent, TransportResult,
};
