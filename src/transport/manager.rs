//! PeerLink Transport
//!
//! Turns the raw messaging primitive into a connection-oriented transport.
//! The connection table, the client id allocator and the event queue live
//! behind one mutex. Messaging callbacks may arrive from the service's own
//! execution context: they only update that state, and no call into the
//! service is ever made while the lock is held.

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

use super::{
    ClientId, ClientIdAllocator, Connection, ConnectionInfo, ConnectionKey, EventQueue, Role,
    TransportConfig, TransportEvent,
};
use crate::messaging::{
    MessagingCallbacks, MessagingError, PeerAddress, PeerMessagingService, ReceivedPacket,
    Reliability, SocketName,
};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is not initialized")]
    NotInitialized,

    #[error("Transport is already initialized")]
    AlreadyInitialized,

    #[error("Transport already started as {0}")]
    AlreadyStarted(Role),

    #[error("No target address set")]
    NoTargetAddress,

    #[error("Client id {0} does not resolve to a peer")]
    UnresolvedClientId(ClientId),

    #[error("Payload of {size} bytes exceeds the {max} byte packet limit for {reliability:?}")]
    PayloadTooLarge {
        size: usize,
        max: usize,
        reliability: Reliability,
    },

    #[error("{operation} is not valid for role {role:?}")]
    WrongRole {
        operation: &'static str,
        role: Option<Role>,
    },

    #[error("No open connection to {0}")]
    NoConnection(PeerAddress),

    #[error("Could not open connection to {0}")]
    OpenFailed(PeerAddress),

    #[error("Messaging service refused packet for {0}")]
    SendFailed(PeerAddress),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Log a caller contract violation; fatal in debug builds.
fn contract_violation(error: TransportError) -> TransportError {
    tracing::error!("Transport contract violation: {}", error);
    if cfg!(debug_assertions) {
        panic!("transport contract violation: {error}");
    }
    error
}

/// State that exists between `initialize` and `shutdown`
struct Session {
    /// Messaging service this session drives
    service: Arc<dyn PeerMessagingService>,
    /// Set by `start_server` / `start_client`
    role: Option<Role>,
    /// Cached from the service at `initialize`
    max_packet_size: usize,
    /// Live connections on our socket, keyed by (peer, socket)
    connections: HashMap<ConnectionKey, Connection>,
    /// Client id <-> peer mapping
    client_ids: ClientIdAllocator,
    /// Connect/disconnect notifications not yet polled
    events: EventQueue,
    /// Data pulled from the service while connect/disconnect events were pending
    deferred: VecDeque<ReceivedPacket>,
}

impl Session {
    fn new(service: Arc<dyn PeerMessagingService>) -> Self {
        let max_packet_size = service.max_packet_size();
        Self {
            service,
            role: None,
            max_packet_size,
            connections: HashMap::new(),
            client_ids: ClientIdAllocator::new(),
            events: EventQueue::new(),
            deferred: VecDeque::new(),
        }
    }

    /// Next queued connect/disconnect, else the next held-back data packet
    fn next_buffered(&mut self, socket: &SocketName) -> Option<TransportEvent> {
        if let Some(event) = self.events.try_dequeue() {
            return Some(event.into());
        }
        while let Some(packet) = self.deferred.pop_front() {
            if let Some(event) = self.data_event(packet, socket) {
                return Some(event);
            }
        }
        None
    }

    fn data_event(&self, packet: ReceivedPacket, socket: &SocketName) -> Option<TransportEvent> {
        if packet.socket != *socket {
            tracing::debug!(
                "Dropping packet from {} on foreign socket {}",
                packet.peer,
                packet.socket
            );
            return None;
        }
        let Some(role) = self.role else {
            tracing::debug!("Dropping packet from {} received before start", packet.peer);
            return None;
        };

        match self.client_ids.lookup_peer(&packet.peer, role) {
            Ok(client_id) => Some(TransportEvent::Data {
                client_id,
                payload: packet.payload,
            }),
            Err(e) => {
                tracing::warn!("Dropping packet from {}: {}", packet.peer, e);
                None
            }
        }
    }
}

struct Shared {
    /// Socket name, channel and initial target
    config: TransportConfig,
    /// Server `start_client` connects to
    target_address: Mutex<Option<PeerAddress>>,
    /// None before `initialize` and after `shutdown`
    session: Mutex<Option<Session>>,
}

impl Shared {
    fn key(&self, peer: &PeerAddress) -> ConnectionKey {
        ConnectionKey::new(peer.clone(), self.config.socket_name.clone())
    }

    fn incoming_requested(&self, peer: &PeerAddress, socket: &SocketName) {
        let (service, accept) = {
            let mut guard = self.session.lock();
            let Some(session) = guard.as_mut() else {
                return;
            };

            let accept = session.role == Some(Role::Server) && *socket == self.config.socket_name;
            if accept {
                let conn = session
                    .connections
                    .entry(self.key(peer))
                    .or_insert_with(|| Connection::new(peer.clone(), socket.clone()));
                conn.accept_incoming();
                conn.request_outgoing();
            }
            (Arc::clone(&session.service), accept)
        };

        if accept {
            tracing::debug!("Accepting connection request from {} on {}", peer, socket);
            if !service.open_connection(peer, socket) {
                tracing::warn!("Messaging service could not accept {}", peer);
                if let Some(session) = self.session.lock().as_mut() {
                    if let Some(mut conn) = session.connections.remove(&self.key(peer)) {
                        conn.close();
                    }
                }
            }
        } else {
            tracing::debug!("Rejecting connection request from {} on {}", peer, socket);
            service.close_connection(peer, socket, true);
        }
    }

    fn connection_opened(&self, peer: &PeerAddress, socket: &SocketName) {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return;
        };
        if *socket != self.config.socket_name {
            tracing::debug!("Ignoring open of foreign socket {} from {}", socket, peer);
            return;
        }
        let Some(role) = session.role else {
            tracing::debug!("Ignoring open from {} before start", peer);
            return;
        };
        if role == Role::Client && session.client_ids.server_address() != Some(peer) {
            tracing::warn!("Ignoring open from {} which is not the server", peer);
            return;
        }

        let conn = session
            .connections
            .entry(self.key(peer))
            .or_insert_with(|| Connection::new(peer.clone(), socket.clone()));
        conn.request_outgoing();
        conn.accept_incoming();
        if !conn.mark_announced() {
            return;
        }

        let client_id = match (conn.client_id(), role) {
            (Some(client_id), _) => client_id,
            (None, Role::Server) => session.client_ids.allocate(peer),
            (None, Role::Client) => ClientId::SERVER,
        };
        conn.assign_client_id(client_id);
        session.events.enqueue(peer.clone(), client_id, true);
        tracing::info!("Connection with {} open as client {}", peer, client_id);
    }

    fn connection_closed(&self, peer: &PeerAddress, socket: &SocketName) {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return;
        };
        if *socket != self.config.socket_name {
            return;
        }

        let Some(mut conn) = session.connections.remove(&self.key(peer)) else {
            tracing::debug!("Close for unknown connection with {}", peer);
            return;
        };
        if !conn.close() {
            return;
        }

        match conn.client_id() {
            Some(client_id) => {
                session.events.enqueue(peer.clone(), client_id, false);
                tracing::info!("Connection with {} closed (client {})", peer, client_id);
            }
            None => {
                tracing::debug!("Connection with {} closed before an id was assigned", peer)
            }
        }
    }
}

/// Callbacks handed to the messaging service
struct CallbackSink {
    /// Weak so the service does not keep a dropped transport alive
    shared: Weak<Shared>,
}

impl MessagingCallbacks for CallbackSink {
    fn on_incoming_connection_requested(&self, peer: &PeerAddress, socket: &SocketName) {
        if let Some(shared) = self.shared.upgrade() {
            shared.incoming_requested(peer, socket);
        }
    }

    fn on_connection_opened(&self, peer: &PeerAddress, socket: &SocketName) {
        if let Some(shared) = self.shared.upgrade() {
            shared.connection_opened(peer, socket);
        }
    }

    fn on_connection_closed(&self, peer: &PeerAddress, socket: &SocketName) {
        if let Some(shared) = self.shared.upgrade() {
            shared.connection_closed(peer, socket);
        }
    }
}

/// Connection-oriented transport on top of a `PeerMessagingService`.
///
/// The public API is meant to be driven from a single tick thread and never
/// blocks. `poll_event` returns pending connects and disconnects before any
/// received data, so a session's Connect is always observed before its Data.
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let target = config.target_address.clone();
        Self {
            shared: Arc::new(Shared {
                config,
                target_address: Mutex::new(target),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn socket_name(&self) -> &SocketName {
        &self.shared.config.socket_name
    }

    fn lock_session(&self) -> TransportResult<MappedMutexGuard<'_, Session>> {
        MutexGuard::try_map(self.shared.session.lock(), Option::as_mut)
            .map_err(|_| contract_violation(TransportError::NotInitialized))
    }

    /// Wire the transport to a messaging service
    pub fn initialize(&self, service: Arc<dyn PeerMessagingService>) -> TransportResult<()> {
        if self.shared.session.lock().is_some() {
            return Err(contract_violation(TransportError::AlreadyInitialized));
        }

        let sink = Arc::new(CallbackSink {
            shared: Arc::downgrade(&self.shared),
        });
        if let Err(e) = service.initialize(sink) {
            tracing::error!("Messaging service failed to initialize: {}", e);
            return Err(e.into());
        }

        let session = Session::new(service);
        tracing::info!(
            "Transport initialized on socket {} (max packet {} bytes)",
            self.shared.config.socket_name,
            session.max_packet_size
        );
        *self.shared.session.lock() = Some(session);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.session.lock().is_some()
    }

    /// Start accepting incoming handshakes
    pub fn start_server(&self) -> TransportResult<()> {
        let mut guard = self.lock_session()?;
        let session = &mut *guard;
        if let Some(role) = session.role {
            tracing::error!("start_server on a transport already started as {}", role);
            return Err(TransportError::AlreadyStarted(role));
        }

        let local = session.service.local_address();
        session.client_ids.set_server_address(local.clone());
        session.role = Some(Role::Server);
        tracing::info!("Server started at {} on socket {}", local, self.shared.config.socket_name);
        Ok(())
    }

    /// Set the server `start_client` connects to
    pub fn set_target_address(&self, target: PeerAddress) {
        tracing::debug!("Target address set to {}", target);
        *self.shared.target_address.lock() = Some(target);
    }

    pub fn target_address(&self) -> Option<PeerAddress> {
        self.shared.target_address.lock().clone()
    }

    /// Open a connection to the target address on the well-known socket
    pub fn start_client(&self) -> TransportResult<()> {
        let socket = self.shared.config.socket_name.clone();
        let (service, target) = {
            let mut guard = self.lock_session()?;
            let session = &mut *guard;
            if let Some(role) = session.role {
                tracing::error!("start_client on a transport already started as {}", role);
                return Err(TransportError::AlreadyStarted(role));
            }
            let Some(target) = self.target_address() else {
                tracing::error!("Cannot start client: no target address set");
                return Err(TransportError::NoTargetAddress);
            };

            session.client_ids.set_server_address(target.clone());
            session.role = Some(Role::Client);

            let mut conn = Connection::new(target.clone(), socket.clone());
            conn.assign_client_id(ClientId::SERVER);
            conn.request_outgoing();
            session.connections.insert(conn.key().clone(), conn);
            (Arc::clone(&session.service), target)
        };

        if !service.open_connection(&target, &socket) {
            tracing::error!("Failed to open connection to server {}", target);
            if let Some(session) = self.shared.session.lock().as_mut() {
                session.connections.remove(&self.shared.key(&target));
                session.client_ids = ClientIdAllocator::new();
                session.role = None;
            }
            return Err(TransportError::OpenFailed(target));
        }

        tracing::info!("Client connecting to {} on socket {}", target, socket);
        Ok(())
    }

    /// Send a payload to a session
    pub fn send(
        &self,
        client_id: ClientId,
        payload: &[u8],
        reliability: Reliability,
    ) -> TransportResult<()> {
        let socket = &self.shared.config.socket_name;
        let (service, peer) = {
            let mut guard = self.lock_session()?;
            let session = &mut *guard;

            let peer = match session.client_ids.resolve_client(client_id) {
                Ok(peer) => peer.clone(),
                Err(e) => {
                    tracing::warn!("Dropping send to client {}: {}", client_id, e);
                    return Err(TransportError::UnresolvedClientId(client_id));
                }
            };

            if payload.len() > session.max_packet_size && !reliability.allows_oversized() {
                tracing::warn!(
                    "Rejecting {} byte {:?} payload for client {} (limit {})",
                    payload.len(),
                    reliability,
                    client_id,
                    session.max_packet_size
                );
                return Err(TransportError::PayloadTooLarge {
                    size: payload.len(),
                    max: session.max_packet_size,
                    reliability,
                });
            }

            let key = self.shared.key(&peer);
            if !session.connections.get(&key).is_some_and(Connection::is_half_open) {
                tracing::warn!("No open connection to {} for client {}", peer, client_id);
                return Err(TransportError::NoConnection(peer));
            }
            (Arc::clone(&session.service), peer)
        };

        let channel = self.shared.config.channel;
        if !service.send_packet(&peer, socket, payload, channel, reliability) {
            tracing::warn!("Messaging service refused packet for {}", peer);
            return Err(TransportError::SendFailed(peer));
        }

        // Counted once the service took the packet
        let mut guard = self.shared.session.lock();
        let sequence = guard
            .as_mut()
            .and_then(|session| session.connections.get_mut(&self.shared.key(&peer)))
            .and_then(|conn| conn.next_message_sequence(payload.len()));
        if let Some(sequence) = sequence {
            tracing::trace!(
                "Sent message {} ({} bytes, {:?}) to client {}",
                sequence,
                payload.len(),
                reliability,
                client_id
            );
        }
        Ok(())
    }

    /// Next event for this tick: pending connects/disconnects first, then
    /// one received data packet, else `Nothing`.
    ///
    /// A data packet is attributed to the client id its sender holds when
    /// the packet is polled. Data a peer sent before disconnecting that is
    /// still unpolled when the same peer reconnects is reported under the
    /// new client id, after the new session's Connect.
    pub fn poll_event(&self) -> TransportEvent {
        let socket = &self.shared.config.socket_name;

        loop {
            let service = {
                let Ok(mut session) = self.lock_session() else {
                    return TransportEvent::Nothing;
                };
                if let Some(event) = session.next_buffered(socket) {
                    return event;
                }
                Arc::clone(&session.service)
            };

            let Some(packet) = service.try_receive_packet() else {
                return TransportEvent::Nothing;
            };

            let mut guard = self.shared.session.lock();
            let Some(session) = guard.as_mut() else {
                return TransportEvent::Nothing;
            };
            // A callback may have queued a connect while the packet was pulled
            if !session.events.is_empty() {
                session.deferred.push_back(packet);
                continue;
            }
            if let Some(event) = session.data_event(packet, socket) {
                return event;
            }
        }
    }

    /// Close a client's connection and notify the remote side (server only)
    pub fn disconnect_remote_client(&self, client_id: ClientId) -> TransportResult<()> {
        let socket = &self.shared.config.socket_name;
        let (service, peer) = {
            let mut guard = self.lock_session()?;
            let session = &mut *guard;
            if session.role != Some(Role::Server) {
                tracing::error!(
                    "disconnect_remote_client requires the server role (role: {:?})",
                    session.role
                );
                return Err(TransportError::WrongRole {
                    operation: "disconnect_remote_client",
                    role: session.role,
                });
            }

            let peer = match session.client_ids.resolve_client(client_id) {
                Ok(peer) => peer.clone(),
                Err(e) => {
                    tracing::warn!("Cannot disconnect client {}: {}", client_id, e);
                    return Err(TransportError::UnresolvedClientId(client_id));
                }
            };
            match session.connections.remove(&self.shared.key(&peer)) {
                Some(mut conn) => {
                    conn.close();
                }
                None => {
                    tracing::warn!(
                        "Cannot disconnect client {}: no connection to {}",
                        client_id,
                        peer
                    );
                    return Err(TransportError::NoConnection(peer));
                }
            }
            (Arc::clone(&session.service), peer)
        };

        tracing::info!("Disconnecting client {} ({})", client_id, peer);
        service.close_connection(&peer, socket, true);
        Ok(())
    }

    /// Close the connection to the server (client only)
    pub fn disconnect_local_client(&self) -> TransportResult<()> {
        let socket = &self.shared.config.socket_name;
        let (service, peer) = {
            let mut guard = self.lock_session()?;
            let session = &mut *guard;
            if session.role != Some(Role::Client) {
                tracing::error!(
                    "disconnect_local_client requires the client role (role: {:?})",
                    session.role
                );
                return Err(TransportError::WrongRole {
                    operation: "disconnect_local_client",
                    role: session.role,
                });
            }

            let Some(peer) = session.client_ids.server_address().cloned() else {
                return Err(TransportError::UnresolvedClientId(ClientId::SERVER));
            };
            match session.connections.remove(&self.shared.key(&peer)) {
                Some(mut conn) => {
                    conn.close();
                }
                None => {
                    tracing::warn!("Already disconnected from {}", peer);
                    return Err(TransportError::NoConnection(peer));
                }
            }
            (Arc::clone(&session.service), peer)
        };

        tracing::info!("Disconnecting from server {}", peer);
        service.close_connection(&peer, socket, true);
        Ok(())
    }

    /// Close every connection and discard all state. Calls other than
    /// `initialize` fail until the transport is initialized again.
    pub fn shutdown(&self) {
        let Some(session) = self.shared.session.lock().take() else {
            tracing::debug!("Shutdown of an uninitialized transport");
            return;
        };

        let mut closed = 0usize;
        for (key, mut conn) in session.connections {
            if conn.close() {
                session.service.close_connection(&key.peer, &key.socket, true);
                closed += 1;
            }
        }
        session.service.shutdown();
        tracing::info!("Transport shut down ({} connections closed)", closed);
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.session.lock().as_ref().and_then(|session| session.role)
    }

    /// Address client id 0 resolves to
    pub fn server_address(&self) -> Option<PeerAddress> {
        self.shared
            .session
            .lock()
            .as_ref()
            .and_then(|session| session.client_ids.server_address().cloned())
    }

    /// Snapshot of the connection a client id currently resolves to
    pub fn connection_info(&self, client_id: ClientId) -> Option<ConnectionInfo> {
        let guard = self.shared.session.lock();
        let session = guard.as_ref()?;
        let peer = session.client_ids.resolve_client(client_id).ok()?;
        session.connections.get(&self.shared.key(peer)).map(Connection::info)
    }

    /// Round-trip time to a session. Not measured; always zero.
    pub fn current_rtt(&self, _client_id: ClientId) -> Duration {
        Duration::ZERO
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::mock::{Call, RecordingService};
    use crate::transport::{ConnectionState, DEFAULT_SOCKET_NAME};

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s).unwrap()
    }

    fn socket() -> SocketName {
        SocketName::new(DEFAULT_SOCKET_NAME).unwrap()
    }

    fn id(n: u64) -> ClientId {
        ClientId::new(n)
    }

    fn server_with(service: Arc<RecordingService>) -> Transport {
        let transport = Transport::default();
        transport.initialize(service).unwrap();
        transport.start_server().unwrap();
        transport
    }

    fn server() -> (Transport, Arc<RecordingService>) {
        let service = RecordingService::new("server");
        (server_with(service.clone()), service)
    }

    fn client() -> (Transport, Arc<RecordingService>) {
        let service = RecordingService::new("me");
        let transport = Transport::new(TransportConfig::default().with_target(addr("server")));
        transport.initialize(service.clone()).unwrap();
        transport.start_client().unwrap();
        (transport, service)
    }

    fn connect(service: &RecordingService, peer: &PeerAddress) {
        service.request_incoming(peer, &socket());
        service.open(peer, &socket());
    }

    fn drain(transport: &Transport) -> Vec<TransportEvent> {
        std::iter::from_fn(|| Some(transport.poll_event()).filter(|e| !e.is_nothing())).collect()
    }

    #[test]
    fn test_incoming_request_accepted_then_connect() {
        let (transport, service) = server();

        service.request_incoming(&addr("peer-a"), &socket());
        assert_eq!(
            service.calls(),
            vec![Call::Open { peer: addr("peer-a"), socket: socket() }]
        );

        service.open(&addr("peer-a"), &socket());
        assert_eq!(transport.poll_event(), TransportEvent::Connect(id(1)));
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
        assert_eq!(
            transport.connection_info(id(1)).unwrap().state,
            ConnectionState::FullyOpen
        );
    }

    #[test]
    fn test_request_on_foreign_socket_rejected() {
        let (transport, service) = server();
        let other = SocketName::new("Other").unwrap();

        service.request_incoming(&addr("peer-a"), &other);
        assert_eq!(
            service.calls(),
            vec![Call::Close { peer: addr("peer-a"), socket: other.clone(), notify_remote: true }]
        );

        service.open(&addr("peer-a"), &other);
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_request_rejected_when_not_server() {
        let (transport, service) = client();
        service.clear_calls();

        service.request_incoming(&addr("peer-a"), &socket());
        assert_eq!(
            service.calls(),
            vec![Call::Close { peer: addr("peer-a"), socket: socket(), notify_remote: true }]
        );
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_request_rejected_before_start() {
        let service = RecordingService::new("server");
        let transport = Transport::default();
        transport.initialize(service.clone()).unwrap();

        service.request_incoming(&addr("peer-a"), &socket());
        assert!(matches!(service.calls()[..], [Call::Close { .. }]));
    }

    #[test]
    fn test_start_client_without_target_fails() {
        let service = RecordingService::new("me");
        let transport = Transport::default();
        transport.initialize(service.clone()).unwrap();

        assert!(matches!(transport.start_client(), Err(TransportError::NoTargetAddress)));
        assert!(service.calls().is_empty());
        assert_eq!(transport.role(), None);
    }

    #[test]
    fn test_start_client_opens_to_target() {
        let service = RecordingService::new("me");
        let transport = Transport::default();
        transport.initialize(service.clone()).unwrap();
        transport.set_target_address(addr("server"));

        transport.start_client().unwrap();
        assert_eq!(service.opens(), vec![addr("server")]);
        assert_eq!(transport.role(), Some(Role::Client));
        assert_eq!(
            transport.connection_info(ClientId::SERVER).unwrap().state,
            ConnectionState::PendingOutgoing
        );

        service.open(&addr("server"), &socket());
        assert_eq!(transport.poll_event(), TransportEvent::Connect(ClientId::SERVER));
        assert_eq!(
            transport.connection_info(ClientId::SERVER).unwrap().state,
            ConnectionState::FullyOpen
        );
    }

    #[test]
    fn test_start_client_open_failure_can_retry() {
        let service = RecordingService::new("me");
        let transport = Transport::new(TransportConfig::default().with_target(addr("server")));
        transport.initialize(service.clone()).unwrap();

        service.set_open_result(false);
        assert!(matches!(transport.start_client(), Err(TransportError::OpenFailed(_))));
        assert_eq!(transport.role(), None);
        assert!(transport.connection_info(ClientId::SERVER).is_none());

        service.set_open_result(true);
        transport.set_target_address(addr("other-server"));
        transport.start_client().unwrap();
        assert_eq!(transport.server_address(), Some(addr("other-server")));
    }

    #[test]
    fn test_start_twice_fails() {
        let (transport, _service) = server();
        assert!(matches!(
            transport.start_server(),
            Err(TransportError::AlreadyStarted(Role::Server))
        ));
        assert!(matches!(
            transport.start_client(),
            Err(TransportError::AlreadyStarted(Role::Server))
        ));
    }

    #[test]
    fn test_server_id_resolves_to_server_for_both_roles() {
        let (server, _) = server();
        assert_eq!(server.server_address(), Some(addr("server")));

        let (client, _) = client();
        assert_eq!(client.server_address(), Some(addr("server")));
    }

    #[test]
    fn test_reconnect_gets_new_id() {
        let (transport, service) = server();

        connect(&service, &addr("peer-a"));
        connect(&service, &addr("peer-b"));
        service.close(&addr("peer-a"), &socket());
        connect(&service, &addr("peer-a"));

        assert_eq!(
            drain(&transport),
            vec![
                TransportEvent::Connect(id(1)),
                TransportEvent::Connect(id(2)),
                TransportEvent::Disconnect(id(1)),
                TransportEvent::Connect(id(3)),
            ]
        );

        assert!(matches!(
            transport.send(id(1), b"stale", Reliability::ReliableOrdered),
            Err(TransportError::UnresolvedClientId(_))
        ));
        transport.send(id(3), b"fresh", Reliability::ReliableOrdered).unwrap();
    }

    #[test]
    fn test_ids_increase_in_order_of_first_sight() {
        let (transport, service) = server();
        for n in 0..5 {
            connect(&service, &addr(&format!("peer-{n}")));
        }

        let ids: Vec<u64> = drain(&transport)
            .iter()
            .filter_map(TransportEvent::client_id)
            .map(ClientId::get)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_send_to_unknown_client() {
        let (transport, service) = server();

        assert!(matches!(
            transport.send(id(99), b"hello", Reliability::ReliableOrdered),
            Err(TransportError::UnresolvedClientId(c)) if c == id(99)
        ));
        assert_eq!(service.sends(), 0);
    }

    #[test]
    fn test_payload_size_boundary() {
        let service = RecordingService::with_max_packet_size("server", 100);
        let transport = server_with(service.clone());
        connect(&service, &addr("peer-a"));

        let exact = vec![7u8; 100];
        for tier in [
            Reliability::UnreliableUnordered,
            Reliability::ReliableUnordered,
            Reliability::ReliableOrdered,
        ] {
            transport.send(id(1), &exact, tier).unwrap();
        }

        let over = vec![7u8; 101];
        assert!(matches!(
            transport.send(id(1), &over, Reliability::UnreliableUnordered),
            Err(TransportError::PayloadTooLarge { size: 101, max: 100, .. })
        ));
        assert!(matches!(
            transport.send(id(1), &over, Reliability::ReliableUnordered),
            Err(TransportError::PayloadTooLarge { .. })
        ));
        transport.send(id(1), &over, Reliability::ReliableOrdered).unwrap();

        assert_eq!(service.sends(), 4);
    }

    #[test]
    fn test_send_passes_channel_and_counts_messages() {
        let service = RecordingService::new("server");
        let transport = Transport::new(TransportConfig::default().with_channel(5));
        transport.initialize(service.clone()).unwrap();
        transport.start_server().unwrap();
        connect(&service, &addr("peer-a"));
        service.clear_calls();

        transport.send(id(1), b"abc", Reliability::UnreliableUnordered).unwrap();
        transport.send(id(1), b"de", Reliability::UnreliableUnordered).unwrap();

        assert_eq!(
            service.calls()[0],
            Call::Send {
                peer: addr("peer-a"),
                socket: socket(),
                payload: b"abc".to_vec(),
                channel: 5,
                reliability: Reliability::UnreliableUnordered,
            }
        );
        let info = transport.connection_info(id(1)).unwrap();
        assert_eq!(info.messages_sent, 2);
        assert_eq!(info.bytes_sent, 5);
    }

    #[test]
    fn test_refused_send_is_not_counted() {
        let (transport, service) = server();
        connect(&service, &addr("peer-a"));

        service.set_send_result(false);
        assert!(matches!(
            transport.send(id(1), b"lost", Reliability::ReliableOrdered),
            Err(TransportError::SendFailed(_))
        ));
        let info = transport.connection_info(id(1)).unwrap();
        assert_eq!(info.messages_sent, 0);
        assert_eq!(info.bytes_sent, 0);

        service.set_send_result(true);
        transport.send(id(1), b"kept", Reliability::ReliableOrdered).unwrap();
        let info = transport.connection_info(id(1)).unwrap();
        assert_eq!(info.messages_sent, 1);
        assert_eq!(info.bytes_sent, 4);
    }

    #[test]
    fn test_callbacks_from_another_thread_keep_connect_first() {
        let (transport, service) = server();

        for n in 1..=50u64 {
            let peer = addr(&format!("peer-{n}"));
            service.request_incoming(&peer, &socket());

            let remote = Arc::clone(&service);
            let remote_peer = peer.clone();
            let handle = std::thread::spawn(move || {
                remote.open(&remote_peer, &socket());
                remote.deliver(&remote_peer, &socket(), b"payload");
            });

            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let mut events = Vec::new();
            while events.len() < 2 {
                assert!(std::time::Instant::now() < deadline, "events for {peer} not polled");
                let event = transport.poll_event();
                if !event.is_nothing() {
                    events.push(event);
                }
            }
            handle.join().unwrap();

            assert_eq!(
                events,
                vec![
                    TransportEvent::Connect(id(n)),
                    TransportEvent::Data {
                        client_id: id(n),
                        payload: bytes::Bytes::from_static(b"payload"),
                    },
                ]
            );
        }
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_send_without_connection() {
        let (transport, service) = server();
        connect(&service, &addr("peer-a"));
        transport.disconnect_remote_client(id(1)).unwrap();
        service.clear_calls();

        assert!(matches!(
            transport.send(id(1), b"x", Reliability::ReliableOrdered),
            Err(TransportError::NoConnection(_))
        ));
        assert_eq!(service.sends(), 0);
    }

    #[test]
    fn test_connect_returned_before_data() {
        let (transport, service) = server();
        connect(&service, &addr("peer-a"));
        service.deliver(&addr("peer-a"), &socket(), b"hello");

        assert_eq!(transport.poll_event(), TransportEvent::Connect(id(1)));
        assert_eq!(
            transport.poll_event(),
            TransportEvent::Data { client_id: id(1), payload: bytes::Bytes::from_static(b"hello") }
        );
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_unmapped_and_foreign_packets_dropped() {
        let (transport, service) = server();
        connect(&service, &addr("peer-a"));
        assert_eq!(transport.poll_event(), TransportEvent::Connect(id(1)));

        service.deliver(&addr("stranger"), &socket(), b"who");
        service.deliver(&addr("peer-a"), &SocketName::new("Other").unwrap(), b"elsewhere");
        service.deliver(&addr("peer-a"), &socket(), b"ok");

        assert_eq!(
            transport.poll_event(),
            TransportEvent::Data { client_id: id(1), payload: bytes::Bytes::from_static(b"ok") }
        );
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_client_only_accepts_data_from_server() {
        let (transport, service) = client();
        service.open(&addr("server"), &socket());
        assert_eq!(transport.poll_event(), TransportEvent::Connect(ClientId::SERVER));

        service.deliver(&addr("stranger"), &socket(), b"spoof");
        service.deliver(&addr("server"), &socket(), b"state");
        assert_eq!(
            transport.poll_event(),
            TransportEvent::Data {
                client_id: ClientId::SERVER,
                payload: bytes::Bytes::from_static(b"state")
            }
        );
    }

    #[test]
    fn test_client_ignores_open_from_non_server() {
        let (transport, service) = client();
        service.open(&addr("stranger"), &socket());
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_disconnect_remote_client() {
        let (transport, service) = server();
        connect(&service, &addr("peer-a"));
        assert_eq!(transport.poll_event(), TransportEvent::Connect(id(1)));
        service.clear_calls();

        transport.disconnect_remote_client(id(1)).unwrap();
        assert_eq!(
            service.calls(),
            vec![Call::Close { peer: addr("peer-a"), socket: socket(), notify_remote: true }]
        );
        assert!(transport.connection_info(id(1)).is_none());

        // Late close callback for a connection we already tore down
        service.close(&addr("peer-a"), &socket());
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_disconnect_unknown_client() {
        let (transport, service) = server();
        assert!(matches!(
            transport.disconnect_remote_client(id(8)),
            Err(TransportError::UnresolvedClientId(_))
        ));
        assert!(service.calls().is_empty());
    }

    #[test]
    fn test_disconnect_wrong_role() {
        let (server, server_service) = server();
        assert!(matches!(
            server.disconnect_local_client(),
            Err(TransportError::WrongRole { role: Some(Role::Server), .. })
        ));
        assert!(server_service.calls().is_empty());

        let (client, client_service) = client();
        client_service.clear_calls();
        assert!(matches!(
            client.disconnect_remote_client(ClientId::SERVER),
            Err(TransportError::WrongRole { role: Some(Role::Client), .. })
        ));
        assert!(client_service.calls().is_empty());
    }

    #[test]
    fn test_disconnect_local_client() {
        let (transport, service) = client();
        service.open(&addr("server"), &socket());
        service.clear_calls();

        transport.disconnect_local_client().unwrap();
        assert_eq!(
            service.calls(),
            vec![Call::Close { peer: addr("server"), socket: socket(), notify_remote: true }]
        );
        assert!(matches!(
            transport.disconnect_local_client(),
            Err(TransportError::NoConnection(_))
        ));
    }

    #[test]
    fn test_remote_close_reaches_client() {
        let (transport, service) = client();
        service.open(&addr("server"), &socket());
        service.close(&addr("server"), &socket());

        assert_eq!(
            drain(&transport),
            vec![
                TransportEvent::Connect(ClientId::SERVER),
                TransportEvent::Disconnect(ClientId::SERVER),
            ]
        );
    }

    #[test]
    fn test_rejected_handshake_reaches_client_as_disconnect() {
        let (transport, service) = client();
        service.close(&addr("server"), &socket());
        assert_eq!(transport.poll_event(), TransportEvent::Disconnect(ClientId::SERVER));
    }

    #[test]
    fn test_close_for_unknown_peer_is_ignored() {
        let (transport, service) = server();
        service.close(&addr("nobody"), &socket());
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
    }

    #[test]
    fn test_shutdown_closes_and_resets() {
        let (transport, service) = server();
        connect(&service, &addr("peer-a"));
        connect(&service, &addr("peer-b"));
        service.clear_calls();

        transport.shutdown();

        let calls = service.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Close { .. })).count(), 2);
        assert_eq!(calls.last(), Some(&Call::Shutdown));
        assert!(!transport.is_initialized());
        assert!(!service.has_callbacks());

        transport.initialize(service.clone()).unwrap();
        assert_eq!(transport.role(), None);
        transport.start_server().unwrap();
        connect(&service, &addr("peer-c"));
        assert_eq!(transport.poll_event(), TransportEvent::Connect(id(1)));
    }

    #[test]
    fn test_initialize_failure_is_returned() {
        let transport = Transport::default();
        let result = transport.initialize(RecordingService::failing_initialize("me"));
        assert!(matches!(result, Err(TransportError::Messaging(_))));
        assert!(!transport.is_initialized());
    }

    #[test]
    fn test_rtt_stub() {
        let (transport, _service) = server();
        assert_eq!(transport.current_rtt(id(1)), Duration::ZERO);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "contract violation")]
    fn test_use_after_shutdown_panics_in_debug() {
        let (transport, _service) = server();
        transport.shutdown();
        let _ = transport.send(id(1), b"x", Reliability::ReliableOrdered);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_use_after_shutdown_errors_in_release() {
        let (transport, service) = server();
        transport.shutdown();
        assert!(matches!(
            transport.send(id(1), b"x", Reliability::ReliableOrdered),
            Err(TransportError::NotInitialized)
        ));
        assert!(matches!(transport.start_server(), Err(TransportError::NotInitialized)));
        assert_eq!(transport.poll_event(), TransportEvent::Nothing);
        assert_eq!(service.sends(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "contract violation")]
    fn test_double_initialize_panics_in_debug() {
        let (transport, service) = server();
        let _ = transport.initialize(service);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_initialize_errors_in_release() {
        let (transport, service) = server();
        assert!(matches!(
            transport.initialize(service),
            Err(TransportError::AlreadyInitialized)
        ));
        assert_eq!(transport.role(), Some(Role::Server));
    }
}
