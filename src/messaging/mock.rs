//! Recording test double for `PeerMessagingService`
//!
//! Captures every call the transport makes and lets tests play the role of
//! the service by injecting callbacks and received packets.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    MessagingCallbacks, MessagingError, MessagingResult, PeerAddress, PeerMessagingService,
    ReceivedPacket, Reliability, SocketName,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open {
        peer: PeerAddress,
        socket: SocketName,
    },
    Close {
        peer: PeerAddress,
        socket: SocketName,
        notify_remote: bool,
    },
    Send {
        peer: PeerAddress,
        socket: SocketName,
        payload: Vec<u8>,
        channel: u8,
        reliability: Reliability,
    },
    Shutdown,
}

#[derive(Default)]
struct MockState {
    /// Callbacks registered by the transport
    callbacks: Option<Arc<dyn MessagingCallbacks>>,
    /// Every call made into the service, in order
    calls: Vec<Call>,
    /// Packets handed out by `try_receive_packet`
    inbox: VecDeque<ReceivedPacket>,
}

pub struct RecordingService {
    /// Address reported by `local_address`
    local: PeerAddress,
    max_packet_size: usize,
    /// Make `initialize` fail
    fail_initialize: bool,
    /// Returned by `open_connection`
    open_result: AtomicBool,
    /// Returned by `send_packet`
    send_result: AtomicBool,
    state: Mutex<MockState>,
}

impl RecordingService {
    pub fn new(local: &str) -> Arc<Self> {
        Self::build(local, 1170, false)
    }

    pub fn with_max_packet_size(local: &str, max_packet_size: usize) -> Arc<Self> {
        Self::build(local, max_packet_size, false)
    }

    pub fn failing_initialize(local: &str) -> Arc<Self> {
        Self::build(local, 1170, true)
    }

    fn build(local: &str, max_packet_size: usize, fail_initialize: bool) -> Arc<Self> {
        Arc::new(Self {
            local: PeerAddress::new(local).unwrap(),
            max_packet_size,
            fail_initialize,
            open_result: AtomicBool::new(true),
            send_result: AtomicBool::new(true),
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn set_open_result(&self, result: bool) {
        self.open_result.store(result, Ordering::SeqCst);
    }

    pub fn set_send_result(&self, result: bool) {
        self.send_result.store(result, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn opens(&self) -> Vec<PeerAddress> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Open { peer, .. } => Some(peer),
                _ => None,
            })
            .collect()
    }

    pub fn sends(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Send { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn has_callbacks(&self) -> bool {
        self.state.lock().callbacks.is_some()
    }

    fn callbacks(&self) -> Arc<dyn MessagingCallbacks> {
        self.state
            .lock()
            .callbacks
            .clone()
            .expect("service was not initialized")
    }

    pub fn request_incoming(&self, peer: &PeerAddress, socket: &SocketName) {
        self.callbacks().on_incoming_connection_requested(peer, socket);
    }

    pub fn open(&self, peer: &PeerAddress, socket: &SocketName) {
        self.callbacks().on_connection_opened(peer, socket);
    }

    pub fn close(&self, peer: &PeerAddress, socket: &SocketName) {
        self.callbacks().on_connection_closed(peer, socket);
    }

    pub fn deliver(&self, peer: &PeerAddress, socket: &SocketName, payload: &[u8]) {
        self.state.lock().inbox.push_back(ReceivedPacket {
            peer: peer.clone(),
            socket: socket.clone(),
            channel: 0,
            payload: Bytes::copy_from_slice(payload),
        });
    }
}

impl PeerMessagingService for RecordingService {
    fn initialize(&self, callbacks: Arc<dyn MessagingCallbacks>) -> MessagingResult<()> {
        if self.fail_initialize {
            return Err(MessagingError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "service unavailable",
            )));
        }
        self.state.lock().callbacks = Some(callbacks);
        Ok(())
    }

    fn local_address(&self) -> PeerAddress {
        self.local.clone()
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn open_connection(&self, peer: &PeerAddress, socket: &SocketName) -> bool {
        self.state.lock().calls.push(Call::Open {
            peer: peer.clone(),
            socket: socket.clone(),
        });
        self.open_result.load(Ordering::SeqCst)
    }

    fn close_connection(&self, peer: &PeerAddress, socket: &SocketName, notify_remote: bool) {
        self.state.lock().calls.push(Call::Close {
            peer: peer.clone(),
            socket: socket.clone(),
            notify_remote,
        });
    }

    fn send_packet(
        &self,
        peer: &PeerAddress,
        socket: &SocketName,
        payload: &[u8],
        channel: u8,
        reliability: Reliability,
    ) -> bool {
        self.state.lock().calls.push(Call::Send {
            peer: peer.clone(),
            socket: socket.clone(),
            payload: payload.to_vec(),
            channel,
            reliability,
        });
        self.send_result.load(Ordering::SeqCst)
    }

    fn try_receive_packet(&self) -> Option<ReceivedPacket> {
        self.state.lock().inbox.pop_front()
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.calls.push(Call::Shutdown);
        state.callbacks = None;
    }
}
