//! UDP messaging backend
//!
//! Peers are addressed by `ip:port`. A background task owns the receive
//! side of the socket and invokes the registered callbacks from the tokio
//! runtime, while sends go out synchronously with `try_send_to`.
//!
//! Delivery is best-effort for every reliability tier: there is no
//! retransmission, and oversized ordered payloads leave as one datagram.
//! A datagram the kernel cannot take right now is dropped like any other
//! lost datagram.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{
    LinkTable, MessagingCallbacks, MessagingError, MessagingResult, PeerAddress,
    PeerMessagingService, ReceivedPacket, Reliability, SocketName,
};
use crate::protocol::{self, Encoder, Packet, MAX_DATAGRAM_SIZE};

/// Consecutive receive errors after which the receive task gives up
const MAX_RECEIVE_ERRORS: u32 = 16;

/// Messaging service speaking the `protocol` wire format over UDP
pub struct UdpMessagingService {
    /// Socket shared with the receive task
    socket: Arc<UdpSocket>,
    /// Address the socket is bound to
    local_addr: SocketAddr,
    /// Largest payload the unordered tiers accept
    max_packet_size: usize,
    /// Runtime the receive task is spawned on
    runtime: Handle,
    /// State shared with the receive task
    shared: Arc<UdpShared>,
}

struct UdpShared {
    state: Mutex<UdpState>,
}

#[derive(Default)]
struct UdpState {
    /// Registered by `initialize`, cleared by `shutdown`
    callbacks: Option<Arc<dyn MessagingCallbacks>>,
    /// Open flags per (peer, socket)
    links: LinkTable,
    /// Data received on established links, oldest first
    inbox: VecDeque<ReceivedPacket>,
    /// Frame encoder carrying the outgoing sequence
    encoder: Encoder,
    /// Background receive loop
    receive_task: Option<JoinHandle<()>>,
}

/// Delay policy for consecutive receive errors
#[derive(Debug, Default)]
struct ReceiveBackoff {
    failures: u32,
}

impl ReceiveBackoff {
    /// Record an error. Returns how long to wait before receiving again, or
    /// None once the error streak is long enough to stop.
    fn on_error(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= MAX_RECEIVE_ERRORS {
            return None;
        }
        Some(Duration::from_millis(5 << self.failures.min(6)))
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

impl UdpMessagingService {
    /// Bind a UDP socket. Must be called from within a tokio runtime.
    pub async fn bind(addr: SocketAddr, max_packet_size: usize) -> MessagingResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        // try_send_to fails until the reactor has seen the socket writable
        socket.writable().await?;
        tracing::info!("UDP messaging bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            max_packet_size,
            runtime: Handle::current(),
            shared: Arc::new(UdpShared {
                state: Mutex::new(UdpState::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_packet_to(&self, peer: &PeerAddress, packet: &Packet) -> bool {
        let Some(addr) = parse_peer(peer) else {
            return false;
        };

        let mut buf = BytesMut::new();
        if let Err(e) = self.shared.state.lock().encoder.encode(packet, &mut buf) {
            tracing::warn!("Failed to encode packet for {}: {}", peer, e);
            return false;
        }

        match self.socket.try_send_to(&buf, addr) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!("UDP send buffer full, dropping datagram to {}", addr);
                true
            }
            Err(e) => {
                tracing::warn!("UDP send to {} failed: {}", addr, e);
                false
            }
        }
    }
}

impl UdpShared {
    fn callbacks(&self) -> Option<Arc<dyn MessagingCallbacks>> {
        self.state.lock().callbacks.clone()
    }

    fn handle_packet(&self, peer: PeerAddress, packet: Packet) {
        match packet {
            Packet::Open { socket } => {
                let notice = self.state.lock().links.open_remote(&peer, &socket);
                if let (Some(notice), Some(callbacks)) = (notice, self.callbacks()) {
                    notice.dispatch(callbacks.as_ref(), &peer, &socket);
                }
            }
            Packet::Close { socket } => {
                let existed = self.state.lock().links.close(&peer, &socket);
                if existed {
                    if let Some(callbacks) = self.callbacks() {
                        callbacks.on_connection_closed(&peer, &socket);
                    }
                }
            }
            Packet::Data { socket, channel, payload, .. } => {
                let mut state = self.state.lock();
                if !state.links.is_established(&peer, &socket) {
                    tracing::debug!("Dropping data from {} on unopened socket {}", peer, socket);
                    return;
                }
                state.inbox.push_back(ReceivedPacket {
                    peer,
                    socket,
                    channel,
                    payload: Bytes::from(payload),
                });
            }
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, shared: Weak<UdpShared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut backoff = ReceiveBackoff::default();

    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(result) => {
                backoff.reset();
                result
            }
            Err(e) => {
                if shared.strong_count() == 0 {
                    break;
                }
                tracing::warn!("UDP receive error: {}", e);
                match backoff.on_error() {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        tracing::error!("Stopping UDP receive after {} errors", MAX_RECEIVE_ERRORS);
                        break;
                    }
                }
            }
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };

        match protocol::decode(&buf[..n]) {
            Ok(frame) => shared.handle_packet(PeerAddress::from(from), frame.packet),
            Err(e) => tracing::debug!("Discarding datagram from {}: {}", from, e),
        }
    }
}

fn parse_peer(peer: &PeerAddress) -> Option<SocketAddr> {
    match peer.as_str().parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            tracing::warn!("Peer address {} is not a socket address", peer);
            None
        }
    }
}

impl PeerMessagingService for UdpMessagingService {
    fn initialize(&self, callbacks: Arc<dyn MessagingCallbacks>) -> MessagingResult<()> {
        let mut state = self.shared.state.lock();
        if state.callbacks.is_some() {
            return Err(MessagingError::AlreadyInitialized);
        }
        state.callbacks = Some(callbacks);
        state.receive_task = Some(self.runtime.spawn(receive_loop(
            Arc::clone(&self.socket),
            Arc::downgrade(&self.shared),
        )));
        Ok(())
    }

    fn local_address(&self) -> PeerAddress {
        PeerAddress::from(self.local_addr)
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn open_connection(&self, peer: &PeerAddress, socket: &SocketName) -> bool {
        if parse_peer(peer).is_none() {
            return false;
        }

        let notice = self.shared.state.lock().links.open_local(peer, socket);
        if !self.send_packet_to(peer, &Packet::Open { socket: socket.clone() }) {
            self.shared.state.lock().links.close(peer, socket);
            return false;
        }

        if let (Some(notice), Some(callbacks)) = (notice, self.shared.callbacks()) {
            notice.dispatch(callbacks.as_ref(), peer, socket);
        }
        true
    }

    fn close_connection(&self, peer: &PeerAddress, socket: &SocketName, notify_remote: bool) {
        self.shared.state.lock().links.close(peer, socket);
        if notify_remote {
            self.send_packet_to(peer, &Packet::Close { socket: socket.clone() });
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
        if payload.len() > self.max_packet_size && !reliability.allows_oversized() {
            return false;
        }
        if !self.shared.state.lock().links.is_established(peer, socket) {
            return false;
        }

        self.send_packet_to(
            peer,
            &Packet::Data {
                socket: socket.clone(),
                channel,
                reliability,
                payload: payload.to_vec(),
            },
        )
    }

    fn try_receive_packet(&self) -> Option<ReceivedPacket> {
        self.shared.state.lock().inbox.pop_front()
    }

    fn shutdown(&self) {
        let links = {
            let mut state = self.shared.state.lock();
            if let Some(task) = state.receive_task.take() {
                task.abort();
            }
            state.callbacks = None;
            state.inbox.clear();
            state.links.drain()
        };

        for (peer, socket) in links {
            self.send_packet_to(&peer, &Packet::Close { socket });
        }
        tracing::info!("UDP messaging on {} shut down", self.local_addr);
    }
}

impl Drop for UdpMessagingService {
    fn drop(&mut self) {
        if let Some(task) = self.shared.state.lock().receive_task.take() {
            task.abort();
        }
    }
}
