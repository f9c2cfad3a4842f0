//! Addressing value types
//!
//! Peer addresses are opaque to the transport; socket names are validated
//! once at construction so the rest of the crate can compare them freely.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a socket name
pub const MAX_SOCKET_NAME_LEN: usize = 32;

/// Address validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Peer address must not be empty")]
    EmptyPeerAddress,

    #[error("Socket name must be 1-{max} characters, got {len}")]
    SocketNameLength { len: usize, max: usize },

    #[error("Socket name contains non-alphanumeric character {0:?}")]
    SocketNameCharacter(char),
}

/// Opaque identifier of an endpoint reachable through the messaging service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, AddressError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(AddressError::EmptyPeerAddress);
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerAddress> for String {
    fn from(address: PeerAddress) -> Self {
        address.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Application-chosen channel name separating independent connections
/// between the same pair of peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SocketName(String);

impl SocketName {
    pub fn new(name: impl Into<String>) -> Result<Self, AddressError> {
        let name = name.into();
        let len = name.chars().count();
        if len == 0 || len > MAX_SOCKET_NAME_LEN {
            return Err(AddressError::SocketNameLength {
                len,
                max: MAX_SOCKET_NAME_LEN,
            });
        }
        if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(AddressError::SocketNameCharacter(c));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SocketName {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SocketName {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SocketName> for String {
    fn from(name: SocketName) -> Self {
        name.0
    }
}
