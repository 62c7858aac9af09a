use std::{
    collections::{hash_map::Entry, HashMap},
    io::{self, Cursor},
    mem,
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use sluice_connection::{
    state::REASON_WRONG_APP_IDENTIFIER,
    Action, Connection, ConnectionState, ConnectionStatistics, IncomingMessage, IncomingMessageKind, PeerContext,
};
use sluice_core::{
    bit_buffer::BitBuffer,
    constants::{CHECKSUM_SIZE, HEADER_BYTE_SIZE},
    transport::Socket,
};
use sluice_protocol::{
    checksum::{append_checksum, validate_and_strip_checksum},
    delivery::{LibraryMessage, MessageType},
    header::{read_message, write_message, MessageHeader},
    library::{decode_payload, encode_payload, DisconnectPayload, HandshakePayload},
    status::ConnectionStatus,
};
use tracing::{error, trace, warn};

use crate::{
    peer::{PeerShared, PeerStatus},
    socket::LinkConditioner,
    statistics::PeerStatistics,
    time::Clock,
};

/// Reason sent to a connecting peer when the connection table is full.
pub const REASON_SERVER_FULL: &str = "Server full";

const RECEIVE_BUFFER_SIZE: usize = 65536;
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Owns the socket on the network thread and writes to it in batches.
///
/// Work produced while processing a tick is collected here and performed once by
/// `flush`: datagrams pass the link conditioner and go to the socket, released
/// messages go to the application queue.
struct Outbox<S: Socket> {
    socket: S,
    context: Arc<PeerContext>,
    conditioner: Option<LinkConditioner>,
    released: Sender<IncomingMessage>,
    pending_sends: Vec<(SocketAddr, Vec<u8>)>,
    pending_events: Vec<IncomingMessage>,
    traffic: PeerStatistics,
}

impl<S: Socket> Outbox<S> {
    fn handle_actions(&mut self, address: SocketAddr, actions: impl Iterator<Item = Action>) {
        for action in actions {
            match action {
                Action::Send(datagram) => self.pending_sends.push((address, datagram)),
                Action::Emit(message) => self.pending_events.push(message),
            }
        }
    }

    fn flush(&mut self, time: Instant, drain_delayed: bool) {
        if let Some(conditioner) = self.conditioner.as_mut() {
            for (address, datagram) in self.pending_sends.drain(..) {
                conditioner.submit(address, datagram, time, self.context.pool());
            }
            if drain_delayed {
                conditioner.take_all(&mut self.pending_sends);
            } else {
                conditioner.take_due(time, &mut self.pending_sends);
            }
        }

        for (address, datagram) in self.pending_sends.drain(..) {
            match self.socket.send_packet(&address, &datagram) {
                Ok(sent) => {
                    self.traffic.packets_sent += 1;
                    self.traffic.bytes_sent += sent as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    warn!("Socket send buffer full, dropping {} bytes to {}", datagram.len(), address)
                }
                Err(err) => error!("Error occurred sending a datagram to {}: {}", address, err),
            }
            self.context.pool().release(datagram);
        }

        for message in self.pending_events.drain(..) {
            let _ = self.released.send(message);
        }
    }
}

/// The network thread: receives, routes, updates connections and sends.
pub(crate) struct NetworkLoop<S: Socket> {
    shared: Arc<PeerShared>,
    clock: Arc<dyn Clock>,
    states: HashMap<SocketAddr, ConnectionState>,
    receive_buffer: Vec<u8>,
    outbox: Outbox<S>,
    closed: ConnectionStatistics,
}

impl<S: Socket> NetworkLoop<S> {
    pub(crate) fn new(shared: Arc<PeerShared>, socket: S, clock: Arc<dyn Clock>) -> Self {
        let context = shared.context.clone();
        let outbox = Outbox {
            socket,
            conditioner: LinkConditioner::from_config(context.config()),
            released: shared.released.0.clone(),
            pending_sends: Vec::new(),
            pending_events: Vec::new(),
            traffic: PeerStatistics::default(),
            context,
        };
        Self {
            shared,
            clock,
            states: HashMap::new(),
            receive_buffer: vec![0; RECEIVE_BUFFER_SIZE],
            outbox,
            closed: ConnectionStatistics::default(),
        }
    }

    /// Runs until the peer requests shutdown.
    pub(crate) fn run(mut self) {
        tracing::debug!("Network thread started");
        loop {
            let time = self.clock.now();
            if self.shared.status() == PeerStatus::ShutdownRequested {
                self.shutdown(time);
                break;
            }
            self.tick(time);
            thread::sleep(TICK_INTERVAL);
        }
        tracing::debug!("Network thread stopped");
    }

    /// One pass of the loop.
    pub(crate) fn tick(&mut self, time: Instant) {
        self.process_connect_requests(time);
        self.receive(time);
        self.process_unconnected_sends();

        let flush = self.shared.context.take_flush();
        for (address, state) in self.states.iter_mut() {
            state.update(time, flush);
            self.outbox.handle_actions(*address, state.drain_actions());
        }

        self.maintain_tables();
        self.publish_statistics();
        self.outbox.flush(time, false);
    }

    fn receive(&mut self, time: Instant) {
        let mut buffer = mem::take(&mut self.receive_buffer);
        loop {
            match self.outbox.socket.receive_packet(&mut buffer) {
                Ok((datagram, address)) => {
                    let len = datagram.len();
                    self.process_datagram(&buffer[..len], address, time);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                // Reported after sending to a closed port on some platforms.
                Err(err) if matches!(err.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => {
                    continue
                }
                Err(err) => {
                    error!("Encountered an error receiving data: {:?}", err);
                    break;
                }
            }
            if self.outbox.socket.is_blocking_mode() {
                break;
            }
        }
        self.receive_buffer = buffer;
    }

    fn process_datagram(&mut self, datagram: &[u8], address: SocketAddr, time: Instant) {
        self.outbox.traffic.packets_received += 1;
        self.outbox.traffic.bytes_received += datagram.len() as u64;

        let datagram = if self.shared.context.config().use_checksums() {
            match validate_and_strip_checksum(datagram) {
                Ok(datagram) => datagram,
                Err(err) => {
                    warn!("Dropping datagram from {}: {}", address, err);
                    return;
                }
            }
        } else {
            datagram
        };

        if let Some(state) = self.states.get_mut(&address) {
            state.on_datagram(datagram.len(), time);
        }

        let mut cursor = Cursor::new(datagram);
        while (cursor.position() as usize) < datagram.len() {
            match read_message(&mut cursor) {
                Ok((header, payload)) => self.route(address, &header, payload, time),
                Err(err) => {
                    warn!("Dropping rest of datagram from {}: {}", address, err);
                    break;
                }
            }
        }
    }

    fn route(&mut self, address: SocketAddr, header: &MessageHeader, payload: &[u8], time: Instant) {
        match header.message_type {
            MessageType::Unconnected => {
                self.release_unconnected(IncomingMessageKind::UnconnectedData, address, header, payload, time)
            }
            MessageType::Library(LibraryMessage::Discovery) => {
                self.release_unconnected(IncomingMessageKind::DiscoveryRequest, address, header, payload, time)
            }
            MessageType::Library(LibraryMessage::DiscoveryResponse) => {
                self.release_unconnected(IncomingMessageKind::DiscoveryResponse, address, header, payload, time)
            }
            message_type => {
                if let Some(state) = self.states.get_mut(&address) {
                    state.process_message(header, payload, time);
                    self.outbox.handle_actions(address, state.drain_actions());
                } else if message_type == MessageType::Library(LibraryMessage::Connect) {
                    self.accept(address, payload, time);
                } else {
                    trace!("Ignoring {:?} from unknown endpoint {}", message_type, address);
                }
            }
        }
    }

    fn release_unconnected(
        &mut self,
        kind: IncomingMessageKind,
        address: SocketAddr,
        header: &MessageHeader,
        payload: &[u8],
        time: Instant,
    ) {
        let context = &self.outbox.context;
        if !context.config().is_message_type_enabled(kind.message_type()) {
            trace!("Ignoring {:?} from {}, message type disabled", header.message_type, address);
            return;
        }
        let mut storage = context.pool().acquire(payload.len());
        storage.extend_from_slice(payload);
        let body = BitBuffer::from_parts(storage, header.payload_bits as usize);
        let message = IncomingMessage::new(kind, time).with_body(body).with_sender(address);
        self.outbox.pending_events.push(message);
    }

    fn accept(&mut self, address: SocketAddr, payload: &[u8], time: Instant) {
        let context = self.shared.context.clone();
        let config = context.config();
        if !config.accept_incoming_connections() {
            trace!("Refusing connect from {}, incoming connections are disabled", address);
            return;
        }
        let request: HandshakePayload = match decode_payload(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!("Malformed connect from {}: {}", address, err);
                return;
            }
        };
        if request.app_identifier != config.app_identifier() {
            self.reject(address, REASON_WRONG_APP_IDENTIFIER);
            return;
        }
        if self.states.len() >= config.maximum_connections() {
            self.reject(address, REASON_SERVER_FULL);
            return;
        }

        let handle = Connection::new(address, context.clone());
        match self.shared.handshakes.lock().entry(address) {
            // A local connect to the same endpoint is about to start.
            Entry::Occupied(_) => return,
            Entry::Vacant(entry) => {
                entry.insert(handle.clone());
            }
        }
        let mut state = ConnectionState::inbound(handle, context, request, time);
        self.outbox.handle_actions(address, state.drain_actions());
        self.states.insert(address, state);
    }

    fn reject(&mut self, address: SocketAddr, reason: &str) {
        tracing::debug!("Rejecting connect from {}: {}", address, reason);
        let (payload, bits) = encode_payload(&DisconnectPayload { reason: reason.to_owned() });
        let datagram = self.encode_datagram(MessageType::Library(LibraryMessage::Disconnect), &payload, bits);
        self.outbox.pending_sends.push((address, datagram));
    }

    fn process_connect_requests(&mut self, time: Instant) {
        while let Ok((handle, hail)) = self.shared.connect_requests.1.try_recv() {
            let address = handle.remote_address();
            if self.states.contains_key(&address) {
                warn!("Already connected to {}, dropping connect request", address);
                self.abandon(&handle);
                continue;
            }
            let mut state = ConnectionState::outbound(handle, self.shared.context.clone(), hail, time);
            self.outbox.handle_actions(address, state.drain_actions());
            self.states.insert(address, state);
        }
    }

    fn abandon(&self, handle: &Connection) {
        handle.set_status(ConnectionStatus::Disconnected);
        let mut handshakes = self.shared.handshakes.lock();
        if handshakes.get(&handle.remote_address()) == Some(handle) {
            handshakes.remove(&handle.remote_address());
        }
    }

    fn process_unconnected_sends(&mut self) {
        while let Ok(send) = self.shared.unconnected.1.try_recv() {
            let datagram = self.encode_datagram(send.message_type, send.payload.as_slice(), send.payload.length_bits());
            self.outbox.pending_sends.push((send.target, datagram));
            send.payload.release(self.outbox.context.pool());
        }
    }

    fn encode_datagram(&self, message_type: MessageType, payload: &[u8], bits: usize) -> Vec<u8> {
        let context = &self.outbox.context;
        let mut datagram = context.pool().acquire(HEADER_BYTE_SIZE + payload.len() + CHECKSUM_SIZE);
        let header = MessageHeader { message_type, is_fragment: false, sequence: 0, payload_bits: bits as u16 };
        if let Err(err) = write_message(&mut datagram, &header, payload) {
            error!("Failed to write {:?}: {}", message_type, err);
        }
        if context.config().use_checksums() {
            append_checksum(&mut datagram);
        }
        datagram
    }

    /// Moves connected handshakes into the connection table and drops closed connections.
    fn maintain_tables(&mut self) {
        let mut closed = Vec::new();
        {
            let mut handshakes = self.shared.handshakes.lock();
            let mut connections = self.shared.connections.write();
            for (address, state) in &self.states {
                match state.status() {
                    ConnectionStatus::Disconnected => {
                        handshakes.remove(address);
                        connections.remove(address);
                        closed.push(*address);
                    }
                    ConnectionStatus::Connected => {
                        if let Some(handle) = handshakes.remove(address) {
                            connections.insert(*address, handle);
                        }
                    }
                    _ => {}
                }
            }
        }
        for address in closed {
            if let Some(state) = self.states.remove(&address) {
                self.closed.accumulate(state.statistics());
            }
        }
    }

    fn publish_statistics(&self) {
        let mut statistics = self.outbox.traffic;
        statistics.add_connection(&self.closed);
        for state in self.states.values() {
            statistics.add_connection(state.statistics());
        }
        statistics.active_connections = self.states.len();
        *self.shared.statistics.lock() = statistics;
    }

    fn shutdown(&mut self, time: Instant) {
        let reason = self.shared.shutdown_reason.lock().clone();
        tracing::debug!("Shutting down {} connections: {}", self.states.len(), reason);

        while let Ok((handle, _)) = self.shared.connect_requests.1.try_recv() {
            self.abandon(&handle);
        }
        while let Ok(send) = self.shared.unconnected.1.try_recv() {
            send.payload.release(self.outbox.context.pool());
        }
        for (address, state) in self.states.iter_mut() {
            state.shutdown(&reason, time);
            self.outbox.handle_actions(*address, state.drain_actions());
        }

        self.maintain_tables();
        self.publish_statistics();
        self.outbox.flush(time, true);
        self.shared.handshakes.lock().clear();
        self.shared.connections.write().clear();
    }
}
