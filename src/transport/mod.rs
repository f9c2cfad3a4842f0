//! Transport module - Connection-oriented transport over peer messaging
//!
//! Provides:
//! - Per-(peer, socket) handshake tracking
//! - Stable client ids for peer addresses
//! - A pull-based event queue polled once per tick

mod client_id;
mod connection;
mod events;
mod manager;

pub use client_id::*;
pub use connection::*;
pub use events::*;
pub use manager::*;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::messaging::{PeerAddress, SocketName};

/// Socket name used when none is configured
pub const DEFAULT_SOCKET_NAME: &str = "PeerLink";

/// Role a transport was started in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Configuration for a transport instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Well-known socket name this transport accepts and opens
    #[serde(default = "default_socket_name")]
    pub socket_name: SocketName,
    /// Channel all packets are sent on
    #[serde(default)]
    pub channel: u8,
    /// Server to connect to when started as a client
    #[serde(default)]
    pub target_address: Option<PeerAddress>,
}

fn default_socket_name() -> SocketName {
    SocketName::new(DEFAULT_SOCKET_NAME).expect("default socket name is valid")
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            channel: 0,
            target_address: None,
        }
    }
}

impl TransportConfig {
    pub fn new(socket_name: SocketName) -> Self {
        Self {
            socket_name,
            ..Default::default()
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_target(mut self, target: PeerAddress) -> Self {
        self.target_address = Some(target);
        self
    }
}
