//! In-process messaging backend
//!
//! A `LoopbackNetwork` hosts any number of `LoopbackService` endpoints in
//! one process. Callbacks fire synchronously from the context of the peer
//! that caused them, never while an endpoint lock is held.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use super::{
    LinkNotice, LinkTable, MessagingCallbacks, MessagingError, MessagingResult,
    PeerAddress, PeerMessagingService, ReceivedPacket, Reliability, SocketName,
};

/// Default packet limit, matching common P2P relay services
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1170;

/// Shared medium connecting loopback endpoints
pub struct LoopbackNetwork {
    /// Largest payload the unordered tiers accept on every endpoint
    max_packet_size: usize,
    /// Registered endpoints; dead entries are replaced on re-registration
    endpoints: Mutex<HashMap<PeerAddress, Weak<LoopbackService>>>,
}

impl LoopbackNetwork {
    pub fn new(max_packet_size: usize) -> Arc<Self> {
        Arc::new(Self {
            max_packet_size,
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new endpoint reachable at `address`
    pub fn endpoint(
        self: &Arc<Self>,
        address: PeerAddress,
    ) -> MessagingResult<Arc<LoopbackService>> {
        let mut endpoints = self.endpoints.lock();
        if endpoints.get(&address).and_then(Weak::upgrade).is_some() {
            return Err(MessagingError::AddressInUse(address));
        }

        let service = Arc::new(LoopbackService {
            address: address.clone(),
            network: Arc::clone(self),
            state: Mutex::new(EndpointState::default()),
        });
        endpoints.insert(address, Arc::downgrade(&service));
        Ok(service)
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn lookup(&self, address: &PeerAddress) -> Option<Arc<LoopbackService>> {
        self.endpoints.lock().get(address).and_then(Weak::upgrade)
    }
}

#[derive(Default)]
struct EndpointState {
    /// Registered by `initialize`, cleared by `shutdown`
    callbacks: Option<Arc<dyn MessagingCallbacks>>,
    /// Open flags per (peer, socket)
    links: LinkTable,
    /// Packets delivered by other endpoints, oldest first
    inbox: VecDeque<ReceivedPacket>,
}

/// One peer on a `LoopbackNetwork`
pub struct LoopbackService {
    /// Address other endpoints reach this one at
    address: PeerAddress,
    /// Network used to look up remote endpoints
    network: Arc<LoopbackNetwork>,
    /// Per-endpoint state, never locked across a callback
    state: Mutex<EndpointState>,
}

impl LoopbackService {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Number of packets waiting to be received
    pub fn pending_packets(&self) -> usize {
        self.state.lock().inbox.len()
    }

    fn callbacks(&self) -> Option<Arc<dyn MessagingCallbacks>> {
        self.state.lock().callbacks.clone()
    }

    fn notify(&self, notice: LinkNotice, peer: &PeerAddress, socket: &SocketName) {
        if let Some(callbacks) = self.callbacks() {
            notice.dispatch(callbacks.as_ref(), peer, socket);
        }
    }

    fn notify_closed(&self, peer: &PeerAddress, socket: &SocketName) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_connection_closed(peer, socket);
        }
    }

    /// Remote peer tore down its side of the link
    fn remote_closed(&self, peer: &PeerAddress, socket: &SocketName) {
        let existed = self.state.lock().links.close(peer, socket);
        if existed {
            self.notify_closed(peer, socket);
        }
    }
}

impl PeerMessagingService for LoopbackService {
    fn initialize(&self, callbacks: Arc<dyn MessagingCallbacks>) -> MessagingResult<()> {
        let mut state = self.state.lock();
        if state.callbacks.is_some() {
            return Err(MessagingError::AlreadyInitialized);
        }
        state.callbacks = Some(callbacks);
        tracing::debug!("Loopback endpoint {} initialized", self.address);
        Ok(())
    }

    fn local_address(&self) -> PeerAddress {
        self.address.clone()
    }

    fn max_packet_size(&self) -> usize {
        self.network.max_packet_size
    }

    fn open_connection(&self, peer: &PeerAddress, socket: &SocketName) -> bool {
        let Some(remote) = self.network.lookup(peer) else {
            tracing::warn!("Loopback open to unknown peer {}", peer);
            return false;
        };

        let local_notice = self.state.lock().links.open_local(peer, socket);
        let remote_notice = remote.state.lock().links.open_remote(&self.address, socket);

        if let Some(notice) = remote_notice {
            remote.notify(notice, &self.address, socket);
        }
        if let Some(notice) = local_notice {
            self.notify(notice, peer, socket);
        }
        true
    }

    fn close_connection(&self, peer: &PeerAddress, socket: &SocketName, notify_remote: bool) {
        self.state.lock().links.close(peer, socket);

        if notify_remote {
            if let Some(remote) = self.network.lookup(peer) {
                remote.remote_closed(&self.address, socket);
            }
        }
    }

    fn send_packet(
        &self,
        peer: &PeerAddress,
        socket: &SocketName,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> bool {
        if payload.len() > self.network.max_packet_size && !reliability.allows_oversized() {
            return false;
        }
        if !self.state.lock().links.is_established(peer, socket) {
            return false;
        }
        let Some(remote) = self.network.lookup(peer) else {
            return false;
        };

        let mut remote_state = remote.state.lock();
        if !remote_state.links.is_established(&self.address, socket) {
            return false;
        }
        remote_state.inbox.push_back(ReceivedPacket {
            peer: self.address.clone(),
            socket: socket.clone(),
            channel,
            payload: Bytes::copy_from_slice(payload),
        });
        true
    }

    fn try_receive_packet(&self) -> Option<ReceivedPacket> {
        self.state.lock().inbox.pop_front()
    }

    fn shutdown(&self) {
        let links = {
            let mut state = self.state.lock();
            state.callbacks = None;
            state.inbox.clear();
            state.links.drain()
        };

        for (peer, socket) in links {
            if let Some(remote) = self.network.lookup(&peer) {
                remote.remote_closed(&self.address, &socket);
            }
        }
        tracing::debug!("Loopback endpoint {} shut down", self.address);
    }
}
