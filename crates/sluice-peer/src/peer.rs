//! The peer: owner of a socket and its network thread.
//!
//! Application threads never touch connection state directly. They read the
//! connection tables under a lock, push sends and connect requests onto queues,
//! and pull released messages from the released queue. The network thread is
//! the only writer of everything else.

use std::{
    collections::HashMap,
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use sluice_connection::{
    send_to_connections, Connection, IncomingMessage, IncomingMessageKind, PeerContext, SendResult,
};
use sluice_core::{
    config::Config,
    error::{ErrorKind, Result},
    message_pool::SharedPayload,
    transport::Socket,
};
use sluice_protocol::{
    delivery::{DeliveryMethod, LibraryMessage, MessageType},
    outgoing::OutgoingMessage,
};

use crate::{
    network::NetworkLoop,
    socket::UdpTransport,
    statistics::PeerStatistics,
    time::{Clock, SystemClock},
};

/// Reason sent to remote peers when a peer is dropped without an explicit shutdown.
pub const REASON_PEER_DROPPED: &str = "Peer shut down";

/// Lifecycle of a peer's network thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerStatus {
    /// No network thread.
    NotRunning = 0,
    /// `start` is binding the socket.
    Starting = 1,
    /// The network thread is running.
    Running = 2,
    /// `shutdown` was called; the network thread is disconnecting everyone.
    ShutdownRequested = 3,
}

impl From<u8> for PeerStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => PeerStatus::Starting,
            2 => PeerStatus::Running,
            3 => PeerStatus::ShutdownRequested,
            _ => PeerStatus::NotRunning,
        }
    }
}

/// A datagram sent outside any connection.
#[derive(Debug)]
pub(crate) struct UnconnectedSend {
    pub(crate) target: SocketAddr,
    pub(crate) message_type: MessageType,
    pub(crate) payload: SharedPayload,
}

type Queue<T> = (Sender<T>, Receiver<T>);

/// State shared between a peer and its network thread.
pub(crate) struct PeerShared {
    pub(crate) context: Arc<PeerContext>,
    status: AtomicU8,
    pub(crate) connections: RwLock<HashMap<SocketAddr, Connection>>,
    pub(crate) handshakes: Mutex<HashMap<SocketAddr, Connection>>,
    pub(crate) connect_requests: Queue<(Connection, Vec<u8>)>,
    pub(crate) unconnected: Queue<UnconnectedSend>,
    pub(crate) released: Queue<IncomingMessage>,
    pub(crate) statistics: Mutex<PeerStatistics>,
    pub(crate) shutdown_reason: Mutex<String>,
    local_address: Mutex<Option<SocketAddr>>,
}

impl PeerShared {
    pub(crate) fn status(&self) -> PeerStatus {
        PeerStatus::from(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: PeerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// A transport endpoint that can both initiate and accept connections.
///
/// All methods take `&self` and may be called from any thread.
pub struct Peer {
    shared: Arc<PeerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Creates a stopped peer that owns `config`.
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(PeerShared {
                context: PeerContext::new(config),
                status: AtomicU8::new(PeerStatus::NotRunning as u8),
                connections: RwLock::new(HashMap::new()),
                handshakes: Mutex::new(HashMap::new()),
                connect_requests: unbounded(),
                unconnected: unbounded(),
                released: unbounded(),
                statistics: Mutex::new(PeerStatistics::default()),
                shutdown_reason: Mutex::new(String::new()),
                local_address: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Binds the socket and starts the network thread.
    pub fn start(&self) -> Result<()> {
        self.start_with_clock(Arc::new(SystemClock))
    }

    /// Binds the socket and starts the network thread, measuring time with `clock`.
    pub fn start_with_clock(&self, clock: Arc<dyn Clock>) -> Result<()> {
        let config = self.shared.context.config();
        if config.enable_upnp() {
            tracing::warn!("UPnP port forwarding is not supported, continuing without it");
        }
        let socket = self.begin_start(|| UdpTransport::bind(config))?;
        self.spawn(socket, clock)
    }

    fn begin_start<S, F: FnOnce() -> Result<S>>(&self, bind: F) -> Result<S> {
        let mut thread = self.thread.lock();
        if self.shared.status() != PeerStatus::NotRunning {
            return Err(ErrorKind::AlreadyRunning);
        }
        if let Some(previous) = thread.take() {
            let _ = previous.join();
        }
        self.shared.set_status(PeerStatus::Starting);
        bind().map_err(|error| {
            self.shared.set_status(PeerStatus::NotRunning);
            error
        })
    }

    fn spawn<S: Socket>(&self, socket: S, clock: Arc<dyn Clock>) -> Result<()> {
        let config = self.shared.context.config();
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(error) => {
                self.shared.set_status(PeerStatus::NotRunning);
                return Err(error.into());
            }
        };
        *self.shared.local_address.lock() = Some(local);
        *self.shared.statistics.lock() = PeerStatistics::default();

        let network = NetworkLoop::new(self.shared.clone(), socket, clock);
        self.shared.set_status(PeerStatus::Running);
        let spawned = thread::Builder::new()
            .name(format!("{} network thread", config.network_thread_name()))
            .spawn(move || network.run());
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                tracing::info!("Peer '{}' listening on {}", config.app_identifier(), local);
                Ok(())
            }
            Err(error) => {
                self.shared.set_status(PeerStatus::NotRunning);
                Err(error.into())
            }
        }
    }

    /// Disconnects every connection with `reason` and stops the network thread.
    ///
    /// Blocks until the thread has sent its disconnects and released the socket.
    pub fn shutdown(&self, reason: &str) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        *self.shared.shutdown_reason.lock() = reason.to_owned();
        self.shared.set_status(PeerStatus::ShutdownRequested);
        if handle.join().is_err() {
            tracing::error!("Network thread panicked");
        }
        self.shared.set_status(PeerStatus::NotRunning);
    }

    /// Current lifecycle status.
    pub fn status(&self) -> PeerStatus {
        self.shared.status()
    }

    /// Address the socket is bound to, once started.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.shared.local_address.lock()
    }

    /// Random identifier sent to remote peers in handshakes.
    pub fn unique_identifier(&self) -> u64 {
        self.shared.context.unique_identifier()
    }

    /// The configuration this peer was created with.
    pub fn configuration(&self) -> &Config {
        self.shared.context.config()
    }

    /// Starts a handshake with `remote`.
    ///
    /// Connecting again while a handshake with `remote` is pending returns the same
    /// connection and sends the handshake again right away.
    pub fn connect(&self, remote: SocketAddr, hail: Option<OutgoingMessage>) -> Result<Connection> {
        if self.status() != PeerStatus::Running {
            return Err(ErrorKind::NotRunning);
        }
        // Lock order: handshakes, then connections. Holding the handshake table keeps
        // the network thread from promoting `remote` between the two lookups.
        let mut handshakes = self.shared.handshakes.lock();
        let established = {
            let connections = self.shared.connections.read();
            if connections.contains_key(&remote) {
                return Err(ErrorKind::AlreadyConnected(remote));
            }
            connections.len()
        };
        if let Some(pending) = handshakes.get(&remote) {
            pending.request_handshake_resend();
            return Ok(pending.clone());
        }
        let live = established + handshakes.len();
        if live >= self.configuration().maximum_connections() {
            return Err(ErrorKind::ConnectionLimitReached);
        }

        let hail = hail.map(|message| self.take_bytes(message)).unwrap_or_default();
        let connection = Connection::new(remote, self.shared.context.clone());
        handshakes.insert(remote, connection.clone());
        drop(handshakes);

        let _ = self.shared.connect_requests.0.send((connection.clone(), hail));
        tracing::debug!("Connecting to {}", remote);
        Ok(connection)
    }

    /// Resolves `host` and connects to it.
    ///
    /// Addresses of the same family as the local socket are preferred.
    pub fn connect_host(&self, host: &str, port: u16, hail: Option<OutgoingMessage>) -> Result<Connection> {
        let remote = resolve(host, port, self.local_address())?;
        self.connect(remote, hail)
    }

    /// Takes the next released message without blocking.
    pub fn read_message(&self) -> Option<IncomingMessage> {
        let message = self.shared.released.1.try_recv().ok()?;
        observe(&message);
        Some(message)
    }

    /// Takes the next released message, waiting up to `timeout` for one.
    pub fn wait_message(&self, timeout: Duration) -> Option<IncomingMessage> {
        let message = self.shared.released.1.recv_timeout(timeout).ok()?;
        observe(&message);
        Some(message)
    }

    /// Moves every released message into `messages`; returns how many were added.
    pub fn read_messages(&self, messages: &mut Vec<IncomingMessage>) -> usize {
        let before = messages.len();
        messages.extend(self.shared.released.1.try_iter().inspect(observe));
        messages.len() - before
    }

    /// Creates an empty message with the configured default capacity.
    pub fn create_message(&self) -> OutgoingMessage {
        self.create_message_with_capacity(self.configuration().default_outgoing_message_capacity())
    }

    /// Creates an empty message with room for `capacity` bytes, reusing pooled storage.
    pub fn create_message_with_capacity(&self, capacity: usize) -> OutgoingMessage {
        OutgoingMessage::from_storage(self.shared.context.pool().acquire(capacity))
    }

    /// Returns the storage of a read message to the pool.
    pub fn recycle(&self, message: IncomingMessage) {
        self.shared.context.pool().release(message.into_storage());
    }

    /// Sends `message` on one connection.
    pub fn send_message(
        &self,
        message: OutgoingMessage,
        recipient: &Connection,
        method: DeliveryMethod,
        channel: u8,
    ) -> SendResult {
        self.send_to_many(message, std::slice::from_ref(recipient), method, channel)
    }

    /// Sends `message` to every connected recipient.
    pub fn send_to_many(
        &self,
        message: OutgoingMessage,
        recipients: &[Connection],
        method: DeliveryMethod,
        channel: u8,
    ) -> SendResult {
        send_to_connections(&self.shared.context, message, recipients, method, channel)
    }

    /// Sends `message` to `target` without a connection.
    pub fn send_unconnected_message(&self, message: OutgoingMessage, target: SocketAddr) -> SendResult {
        self.send_unconnected(MessageType::Unconnected, message, target)
    }

    /// Answers a discovery request from `target`.
    pub fn send_discovery_response(&self, message: OutgoingMessage, target: SocketAddr) -> SendResult {
        self.send_unconnected(MessageType::Library(LibraryMessage::DiscoveryResponse), message, target)
    }

    /// Broadcasts a discovery request to `port` on the configured broadcast address.
    pub fn discover_local_peers(&self, port: u16) -> Result<()> {
        let target = SocketAddr::new(self.configuration().broadcast_address(), port);
        self.discover_known_peer(target)
    }

    /// Sends a discovery request to one known address.
    pub fn discover_known_peer(&self, target: SocketAddr) -> Result<()> {
        match self.send_unconnected(MessageType::Library(LibraryMessage::Discovery), OutgoingMessage::default(), target) {
            SendResult::NotConnected => Err(ErrorKind::NotRunning),
            _ => Ok(()),
        }
    }

    fn send_unconnected(&self, message_type: MessageType, message: OutgoingMessage, target: SocketAddr) -> SendResult {
        let pool = self.shared.context.pool();
        let (payload, _) = message.into_payload();
        if self.status() != PeerStatus::Running {
            payload.release(pool);
            return SendResult::NotConnected;
        }
        if payload.length_bits() > u16::MAX as usize {
            payload.release(pool);
            return SendResult::MessageTooLarge;
        }
        let _ = self.shared.unconnected.0.send(UnconnectedSend { target, message_type, payload });
        SendResult::Sent
    }

    /// Sends queued messages on the next tick when `auto_flush_send_queue` is off.
    pub fn flush_send_queue(&self) {
        self.shared.context.request_flush();
    }

    /// Peer-wide traffic counters as of the last network tick.
    pub fn statistics(&self) -> PeerStatistics {
        *self.shared.statistics.lock()
    }

    /// Snapshot of the established connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections.read().values().cloned().collect()
    }

    /// Number of established connections.
    pub fn connections_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    /// Looks up the connection or pending handshake with `remote`.
    pub fn get_connection(&self, remote: SocketAddr) -> Option<Connection> {
        let handshakes = self.shared.handshakes.lock();
        if let Some(connection) = self.shared.connections.read().get(&remote) {
            return Some(connection.clone());
        }
        handshakes.get(&remote).cloned()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<PeerShared> {
        self.shared.clone()
    }

    pub(crate) fn pending_handshakes(&self) -> Vec<Connection> {
        self.shared.handshakes.lock().values().cloned().collect()
    }

    pub(crate) fn discard(&self, message: OutgoingMessage) {
        let (payload, _) = message.into_payload();
        payload.release(self.shared.context.pool());
    }

    fn take_bytes(&self, message: OutgoingMessage) -> Vec<u8> {
        let (payload, _) = message.into_payload();
        let bytes = payload.as_slice().to_vec();
        payload.release(self.shared.context.pool());
        bytes
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("app_identifier", &self.configuration().app_identifier())
            .field("status", &self.status())
            .field("local_address", &self.local_address())
            .finish()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown(REASON_PEER_DROPPED);
    }
}

fn observe(message: &IncomingMessage) {
    if let IncomingMessageKind::StatusChanged { status, .. } = message.kind() {
        if let Some(connection) = message.connection() {
            connection.set_visible_status(*status);
        }
    }
}

fn resolve(host: &str, port: u16, local: Option<SocketAddr>) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| ErrorKind::UnresolvedHost(host.to_owned()))?
        .collect();
    let want_ipv6 = local.is_some_and(|address| address.is_ipv6());
    candidates
        .iter()
        .find(|address| address.is_ipv6() == want_ipv6)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| ErrorKind::UnresolvedHost(host.to_owned()))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn config() -> Config {
        Config::builder("peer-test").local_address(IpAddr::V4(Ipv4Addr::LOCALHOST)).build().unwrap()
    }

    #[test]
    fn test_connect_requires_running_peer() {
        let peer = Peer::new(config());
        let result = peer.connect("127.0.0.1:9".parse().unwrap(), None);
        assert!(matches!(result, Err(ErrorKind::NotRunning)));
        assert!(matches!(peer.discover_known_peer("127.0.0.1:9".parse().unwrap()), Err(ErrorKind::NotRunning)));
    }

    #[test]
    fn test_start_twice_fails() {
        let peer = Peer::new(config());
        peer.start().unwrap();
        assert_eq!(peer.status(), PeerStatus::Running);
        assert!(matches!(peer.start(), Err(ErrorKind::AlreadyRunning)));
        peer.shutdown("done");
        assert_eq!(peer.status(), PeerStatus::NotRunning);
    }

    #[test]
    fn test_restart_after_shutdown() {
        let peer = Peer::new(config());
        peer.start().unwrap();
        peer.shutdown("first");
        peer.start().unwrap();
        assert!(peer.local_address().is_some());
        peer.shutdown("second");
    }

    #[test]
    fn test_pending_connect_is_reused() {
        let peer = Peer::new(config());
        peer.start().unwrap();
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let first = peer.connect(remote, None).unwrap();
        let second = peer.connect(remote, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(peer.get_connection(remote), Some(first));
        assert_eq!(peer.connections_count(), 0);
    }

    #[test]
    fn test_connect_after_promotion_is_refused() {
        let peer = Peer::new(config());
        peer.start().unwrap();
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let pending = peer.connect(remote, None).unwrap();

        // Promote the handshake the way the network thread does, under both locks.
        {
            let shared = peer.shared();
            let mut handshakes = shared.handshakes.lock();
            let mut connections = shared.connections.write();
            let handle = handshakes.remove(&remote).unwrap();
            connections.insert(remote, handle);
        }

        assert!(matches!(peer.connect(remote, None), Err(ErrorKind::AlreadyConnected(address)) if address == remote));
        assert_eq!(peer.get_connection(remote), Some(pending));
        assert!(peer.pending_handshakes().is_empty());
        peer.shutdown("done");
    }

    #[test]
    fn test_connection_limit() {
        let config = config().to_builder().maximum_connections(1).build().unwrap();
        let peer = Peer::new(config);
        peer.start().unwrap();
        peer.connect("127.0.0.1:9".parse().unwrap(), None).unwrap();
        let result = peer.connect("127.0.0.1:10".parse().unwrap(), None);
        assert!(matches!(result, Err(ErrorKind::ConnectionLimitReached)));
    }

    #[test]
    fn test_created_message_uses_pool() {
        let peer = Peer::new(config());
        let mut message = peer.create_message();
        message.write_u32(7);
        assert_eq!(message.length_bits(), 32);

        let unsent = peer.send_unconnected_message(message, "127.0.0.1:9".parse().unwrap());
        assert_eq!(unsent, SendResult::NotConnected);
        assert_eq!(peer.shared.context.pool().available(), 1);
    }

    #[test]
    fn test_resolve_prefers_local_family() {
        let v4 = resolve("127.0.0.1", 80, Some("127.0.0.1:1".parse().unwrap())).unwrap();
        assert_eq!(v4, "127.0.0.1:80".parse().unwrap());
        assert!(matches!(resolve("no such host.invalid", 80, None), Err(ErrorKind::UnresolvedHost(_))));
    }

    #[test]
    fn test_status_round_trips_through_u8() {
        for status in [PeerStatus::NotRunning, PeerStatus::Starting, PeerStatus::Running, PeerStatus::ShutdownRequested] {
            assert_eq!(PeerStatus::from(status as u8), status);
        }
    }
}
