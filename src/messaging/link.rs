//! Link bookkeeping shared by messaging backends
//!
//! Each backend tracks, per (peer, socket), whether the local side has
//! opened and whether the remote side has. The table decides which
//! callback a transition should fire so every backend reports handshake
//! progress the same way.

use std::collections::HashMap;

use super::{MessagingCallbacks, PeerAddress, SocketName};

/// What a link transition should report to the registered callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkNotice {
    /// The remote side asked first; the local side has not answered yet
    IncomingRequested,
    /// Both sides are now open
    Opened,
}

impl LinkNotice {
    /// Deliver this notice to `callbacks`
    pub fn dispatch(
        self,
        callbacks: &dyn MessagingCallbacks,
        peer: &PeerAddress,
        socket: &SocketName,
    ) {
        match self {
            LinkNotice::IncomingRequested => {
                callbacks.on_incoming_connection_requested(peer, socket)
            }
            LinkNotice::Opened => callbacks.on_connection_opened(peer, socket),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Link {
    /// `open_connection` was called locally
    local_open: bool,
    /// The remote side asked to open
    remote_open: bool,
    /// `Opened` was already reported
    announced: bool,
}

impl Link {
    fn settle(&mut self) -> Option<LinkNotice> {
        if self.local_open && self.remote_open && !self.announced {
            self.announced = true;
            Some(LinkNotice::Opened)
        } else {
            None
        }
    }
}

/// Per-(peer, socket) open flags for one endpoint
#[derive(Debug, Default)]
pub struct LinkTable {
    links: HashMap<(PeerAddress, SocketName), Link>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local side opened or accepted the link
    pub fn open_local(&mut self, peer: &PeerAddress, socket: &SocketName) -> Option<LinkNotice> {
        let link = self.links.entry((peer.clone(), socket.clone())).or_default();
        link.local_open = true;
        link.settle()
    }

    /// Remote side opened or accepted the link
    pub fn open_remote(&mut self, peer: &PeerAddress, socket: &SocketName) -> Option<LinkNotice> {
        let link = self.links.entry((peer.clone(), socket.clone())).or_default();
        if link.remote_open {
            return None;
        }
        link.remote_open = true;
        if link.local_open {
            link.settle()
        } else {
            Some(LinkNotice::IncomingRequested)
        }
    }

    /// Forget a link. Returns whether it existed.
    pub fn close(&mut self, peer: &PeerAddress, socket: &SocketName) -> bool {
        self.links.remove(&(peer.clone(), socket.clone())).is_some()
    }

    pub fn is_established(&self, peer: &PeerAddress, socket: &SocketName) -> bool {
        self.links
            .get(&(peer.clone(), socket.clone()))
            .map(|link| link.local_open && link.remote_open)
            .unwrap_or(false)
    }

    /// Remove every link, returning their keys
    pub fn drain(&mut self) -> Vec<(PeerAddress, SocketName)> {
        self.links.drain().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
