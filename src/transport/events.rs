//! Transport events
//!
//! Connection progress reported by the messaging service is buffered here
//! as immutable values and handed out one at a time by `poll_event`.

use bytes::Bytes;
use std::collections::VecDeque;

use super::ClientId;
use crate::messaging::PeerAddress;

/// Kind of event returned by `Transport::poll_event`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Nothing,
    Connect,
    Disconnect,
    Data,
}

/// Event returned to the upper framework, once per poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Nothing pending this tick
    Nothing,
    /// A session became available
    Connect(ClientId),
    /// A session went away
    Disconnect(ClientId),
    /// Payload received from a session
    Data { client_id: ClientId, payload: Bytes },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Nothing => EventKind::Nothing,
            TransportEvent::Connect(_) => EventKind::Connect,
            TransportEvent::Disconnect(_) => EventKind::Disconnect,
            TransportEvent::Data { .. } => EventKind::Data,
        }
    }

    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            TransportEvent::Nothing => None,
            TransportEvent::Connect(id) | TransportEvent::Disconnect(id) => Some(*id),
            TransportEvent::Data { client_id, .. } => Some(*client_id),
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            TransportEvent::Data { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, TransportEvent::Nothing)
    }
}

/// A queued connect or disconnect notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub peer: PeerAddress,
    pub client_id: ClientId,
    pub is_connect: bool,
}

impl From<PendingEvent> for TransportEvent {
    fn from(event: PendingEvent) -> Self {
        if event.is_connect {
            TransportEvent::Connect(event.client_id)
        } else {
            TransportEvent::Disconnect(event.client_id)
        }
    }
}

/// Strict FIFO of pending connect/disconnect notifications
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<PendingEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, peer: PeerAddress, client_id: ClientId, is_connect: bool) {
        tracing::debug!(
            "Queued {} for client {} ({})",
            if is_connect { "connect" } else { "disconnect" },
            client_id,
            peer
        );
        self.events.push_back(PendingEvent {
            peer,
            client_id,
            is_connect,
        });
    }

    pub fn try_dequeue(&mut self) -> Option<PendingEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
