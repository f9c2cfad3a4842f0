//! Connection handling for PeerLink
//!
//! Tracks the handshake of one (peer, socket) pair:
//! - Outgoing and incoming halves set independently
//! - One-shot validity: a closed connection is never reopened
//! - Per-connection message sequence and send statistics

use std::time::{Duration, Instant};

use super::ClientId;
use crate::messaging::{PeerAddress, SocketName};

/// Handshake state of a connection, derived from its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Neither side has opened yet
    Unopened,
    /// We opened, the peer has not
    PendingOutgoing,
    /// The peer opened, we have not
    PendingIncoming,
    /// Both sides opened
    FullyOpen,
    /// Terminal
    Closed,
}

/// Table key for a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Remote peer
    pub peer: PeerAddress,
    /// Socket name the connection was opened on
    pub socket: SocketName,
}

impl ConnectionKey {
    pub fn new(peer: PeerAddress, socket: SocketName) -> Self {
        Self { peer, socket }
    }
}

/// Snapshot of a connection handed out to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote peer
    pub peer: PeerAddress,
    /// Socket name the connection was opened on
    pub socket: SocketName,
    /// Handshake state at the time of the snapshot
    pub state: ConnectionState,
    /// Id the session is reported under, once assigned
    pub client_id: Option<ClientId>,
    /// Messages the messaging service accepted so far
    pub messages_sent: u64,
    pub bytes_sent: u64,
    /// Time since the connection object was created
    pub age: Duration,
}

/// Handshake state for one (peer, socket) pair
#[derive(Debug)]
pub struct Connection {
    /// Peer and socket this connection belongs to
    key: ConnectionKey,
    /// We opened (or accepted) our half
    opened_outgoing: bool,
    /// The peer opened its half
    opened_incoming: bool,
    /// Cleared by `close`; no transition happens afterwards
    valid: bool,
    /// Set once the Connect event for this connection was queued
    announced: bool,
    /// Id the session is reported under
    client_id: Option<ClientId>,
    /// Next message sequence number, equal to messages sent so far
    message_sequence: u64,
    /// Payload bytes sent so far
    bytes_sent: u64,
    /// Creation time, for `age`
    created_at: Instant,
}

impl Connection {
    pub fn new(peer: PeerAddress, socket: SocketName) -> Self {
        Self {
            key: ConnectionKey::new(peer, socket),
            opened_outgoing: false,
            opened_incoming: false,
            valid: true,
            announced: false,
            client_id: None,
            message_sequence: 0,
            bytes_sent: 0,
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.key.peer
    }

    pub fn socket(&self) -> &SocketName {
        &self.key.socket
    }

    /// Local side opened (or accepted). Returns true if this completed the handshake.
    pub fn request_outgoing(&mut self) -> bool {
        if !self.valid {
            tracing::trace!("Ignoring outgoing open on closed connection to {}", self.key.peer);
            return false;
        }
        let was_open = self.is_fully_open();
        self.opened_outgoing = true;
        !was_open && self.is_fully_open()
    }

    /// Remote side opened. Returns true if this completed the handshake.
    pub fn accept_incoming(&mut self) -> bool {
        if !self.valid {
            tracing::trace!("Ignoring incoming open on closed connection to {}", self.key.peer);
            return false;
        }
        let was_open = self.is_fully_open();
        self.opened_incoming = true;
        !was_open && self.is_fully_open()
    }

    /// Close the connection for good.
    ///
    /// Returns true only on the first close of a connection that had reached
    /// half-open, i.e. when the close is worth reporting.
    pub fn close(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.valid = false;
        self.is_half_open()
    }

    /// Mark the Connect notification as delivered. Returns false if it already was.
    pub fn mark_announced(&mut self) -> bool {
        if !self.valid || self.announced {
            return false;
        }
        self.announced = true;
        true
    }

    pub fn is_announced(&self) -> bool {
        self.announced
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn assign_client_id(&mut self, client_id: ClientId) {
        self.client_id = Some(client_id);
    }

    /// Issue the next message sequence number and account for the payload.
    /// Returns None once the connection is closed.
    pub fn next_message_sequence(&mut self, payload_len: usize) -> Option<u64> {
        if !self.valid {
            return None;
        }
        let sequence = self.message_sequence;
        self.message_sequence += 1;
        self.bytes_sent += payload_len as u64;
        Some(sequence)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_pending_outgoing(&self) -> bool {
        self.opened_outgoing && !self.opened_incoming
    }

    pub fn is_pending_incoming(&self) -> bool {
        !self.opened_outgoing && self.opened_incoming
    }

    pub fn is_half_open(&self) -> bool {
        self.opened_outgoing || self.opened_incoming
    }

    pub fn is_fully_open(&self) -> bool {
        self.opened_outgoing && self.opened_incoming
    }

    pub fn state(&self) -> ConnectionState {
        if !self.valid {
            ConnectionState::Closed
        } else if self.is_fully_open() {
            ConnectionState::FullyOpen
        } else if self.is_pending_outgoing() {
            ConnectionState::PendingOutgoing
        } else if self.is_pending_incoming() {
            ConnectionState::PendingIncoming
        } else {
            ConnectionState::Unopened
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.key.peer.clone(),
            socket: self.key.socket.clone(),
            state: self.state(),
            client_id: self.client_id,
            messages_sent: self.message_sequence,
            bytes_sent: self.bytes_sent,
            age: self.age(),
        }
    }
}
