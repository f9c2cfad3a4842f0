//! Client id allocation
//!
//! Maps stable local session ids to peer addresses in both directions.
//! Id `0` is reserved for the server and resolved from the server address
//! rather than the maps. Ids are never reused or removed: a peer that
//! reconnects gets a fresh id, and its old id is retired.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::Role;
use crate::messaging::PeerAddress;

/// Small stable integer identifying a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Always denotes the server, in both roles
    pub const SERVER: ClientId = ClientId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Server address is not known yet")]
    ServerUnknown,

    #[error("Client id {0} is not mapped to a peer")]
    UnknownClientId(ClientId),

    #[error("Client id {0} was replaced by a newer session")]
    Retired(ClientId),

    #[error("Peer {0} is not mapped to a client id")]
    UnknownPeer(PeerAddress),

    #[error("Peer {0} is not the server")]
    NotServer(PeerAddress),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Bidirectional client id <-> peer address mapping
#[derive(Debug)]
pub struct ClientIdAllocator {
    server_address: Option<PeerAddress>,
    next_id: u64,
    peers: HashMap<ClientId, PeerAddress>,
    clients: HashMap<PeerAddress, ClientId>,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self {
            server_address: None,
            next_id: 1,
            peers: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Lock in the server address. Returns false if a different one is already set.
    pub fn set_server_address(&mut self, address: PeerAddress) -> bool {
        match &self.server_address {
            Some(existing) => *existing == address,
            None => {
                self.server_address = Some(address);
                true
            }
        }
    }

    pub fn server_address(&self) -> Option<&PeerAddress> {
        self.server_address.as_ref()
    }

    /// Resolve a client id to the peer it addresses
    pub fn resolve_client(&self, client_id: ClientId) -> ResolveResult<&PeerAddress> {
        if client_id.is_server() {
            return self.server_address.as_ref().ok_or(ResolveError::ServerUnknown);
        }

        let peer = self
            .peers
            .get(&client_id)
            .ok_or(ResolveError::UnknownClientId(client_id))?;

        match self.clients.get(peer) {
            Some(current) if *current == client_id => Ok(peer),
            _ => Err(ResolveError::Retired(client_id)),
        }
    }

    /// Resolve a peer to its client id, allocating one on first sight when
    /// acting as server.
    pub fn resolve_peer(&mut self, peer: &PeerAddress, role: Role) -> ResolveResult<ClientId> {
        match self.lookup_peer(peer, role) {
            Err(ResolveError::UnknownPeer(_)) if role == Role::Server => Ok(self.allocate(peer)),
            other => other,
        }
    }

    /// Resolve a peer without allocating
    pub fn lookup_peer(&self, peer: &PeerAddress, role: Role) -> ResolveResult<ClientId> {
        if self.server_address.as_ref() == Some(peer) {
            return Ok(ClientId::SERVER);
        }

        match role {
            Role::Server => self
                .clients
                .get(peer)
                .copied()
                .ok_or_else(|| ResolveError::UnknownPeer(peer.clone())),
            Role::Client => Err(ResolveError::NotServer(peer.clone())),
        }
    }

    /// Issue a fresh id for `peer`. Any id the peer held before stays
    /// mapped to it but no longer resolves.
    pub fn allocate(&mut self, peer: &PeerAddress) -> ClientId {
        let client_id = ClientId(self.next_id);
        self.next_id += 1;

        self.peers.insert(client_id, peer.clone());
        if let Some(previous) = self.clients.insert(peer.clone(), client_id) {
            tracing::debug!("Peer {} re-mapped from client {} to {}", peer, previous, client_id);
        }
        client_id
    }

    /// Number of ids ever issued
    pub fn allocated(&self) -> usize {
        self.peers.len()
    }
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
