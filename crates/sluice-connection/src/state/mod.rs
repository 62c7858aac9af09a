//! Network-thread state of one connection.
//!
//! `ConnectionState` is owned by the peer's network thread and never shared. It is
//! driven by two calls:
//! - `process_message` for every message the network loop routes to it;
//! - `update` once per tick, which handles application requests, handshake resends,
//!   pings and timeouts, then moves queued messages onto the wire.
//!
//! Both only record what should happen as [`Action`]s; the network loop drains
//! them with `drain_actions` and performs the socket writes and queue pushes.

mod handshake;
mod receive;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use sluice_core::{
    bit_buffer::BitBuffer,
    constants::{HEADER_BYTE_SIZE, NUM_TOTAL_CHANNELS},
};
use sluice_protocol::{
    delivery::{DeliveryMethod, LibraryMessage, MessageType},
    header::MessageHeader,
    library::{encode_acknowledgements, encode_payload, Acknowledgement, DisconnectPayload, ACKNOWLEDGEMENT_SIZE},
    status::ConnectionStatus,
};

use crate::{
    channel::{ReceiverChannel, SenderChannel, Transmission},
    context::PeerContext,
    datagram::DatagramWriter,
    fragment_group::FragmentTable,
    handle::{Connection, ConnectionRequest},
    incoming::{IncomingMessage, IncomingMessageKind},
    mtu_expansion::MtuExpansion,
    statistics::ConnectionStatistics,
};

/// Round-trip estimate used for resend timing before the first pong.
pub const INITIAL_AVERAGE_ROUND_TRIP_TIME: Duration = Duration::from_millis(100);
/// Fixed part of the resend delay, added to twice the average round-trip time.
pub const RESEND_DELAY_BASE: Duration = Duration::from_millis(25);

/// Reason given when the handshake runs out of attempts.
pub const REASON_HANDSHAKE_FAILED: &str = "Failed to establish connection - no response from remote host";
/// Reason given when nothing was heard for the connection timeout.
pub const REASON_TIMED_OUT: &str = "Connection timed out";
/// Reason sent to a peer whose application identifier differs.
pub const REASON_WRONG_APP_IDENTIFIER: &str = "Wrong application identifier!";

/// Work produced by a connection for the network loop.
#[derive(Debug)]
pub enum Action {
    /// Send this datagram to the connection's remote endpoint.
    Send(Vec<u8>),
    /// Release this message to the application.
    Emit(IncomingMessage),
}

type ReceivedPayload = (BitBuffer, bool);

/// Connection state owned by the network thread.
pub struct ConnectionState {
    handle: Connection,
    context: Arc<PeerContext>,
    status: ConnectionStatus,
    local_hail: Vec<u8>,
    handshake_attempts: u32,
    last_handshake_sent: Option<Instant>,
    last_heard: Instant,
    ping_number: u8,
    ping_sent_at: Option<Instant>,
    last_ping: Option<Instant>,
    average_rtt: Option<Duration>,
    senders: Vec<Option<SenderChannel>>,
    receivers: Vec<Option<ReceiverChannel<ReceivedPayload>>>,
    pending_acks: Vec<Acknowledgement>,
    fragments: FragmentTable,
    mtu: MtuExpansion,
    writer: DatagramWriter,
    transmissions: Vec<Transmission>,
    actions: Vec<Action>,
    statistics: ConnectionStatistics,
}

impl ConnectionState {
    fn new(handle: Connection, context: Arc<PeerContext>, time: Instant) -> Self {
        let config = context.config();
        let mtu = MtuExpansion::new(config, time);
        let writer = DatagramWriter::new(mtu.current_mtu(), config.use_checksums());
        Self {
            handle,
            status: ConnectionStatus::None,
            local_hail: Vec::new(),
            handshake_attempts: 0,
            last_handshake_sent: None,
            last_heard: time,
            ping_number: 0,
            ping_sent_at: None,
            last_ping: None,
            average_rtt: None,
            senders: (0..NUM_TOTAL_CHANNELS).map(|_| None).collect(),
            receivers: (0..NUM_TOTAL_CHANNELS).map(|_| None).collect(),
            pending_acks: Vec::new(),
            fragments: FragmentTable::new(config.maximum_message_size(), config.maximum_fragment_groups()),
            mtu,
            writer,
            transmissions: Vec::new(),
            actions: Vec::new(),
            statistics: ConnectionStatistics::default(),
            context,
        }
    }

    /// Application handle of this connection.
    pub fn handle(&self) -> &Connection {
        &self.handle
    }

    /// Authoritative status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Smoothed round-trip time, once measured.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_rtt
    }

    /// Traffic counters.
    pub fn statistics(&self) -> &ConnectionStatistics {
        &self.statistics
    }

    /// Returns true once the connection reached its terminal state.
    pub fn is_disconnected(&self) -> bool {
        self.status == ConnectionStatus::Disconnected
    }

    /// Returns true if no user message is queued or awaiting acknowledgment.
    pub fn is_idle(&self) -> bool {
        self.senders.iter().flatten().all(SenderChannel::is_idle)
    }

    /// Takes the work recorded since the last call.
    pub fn drain_actions(&mut self) -> std::vec::Drain<'_, Action> {
        self.actions.drain(..)
    }

    /// Accounts for one datagram received from the remote endpoint.
    pub fn on_datagram(&mut self, len: usize, time: Instant) {
        self.statistics.packets_received += 1;
        self.statistics.bytes_received += len as u64;
        self.last_heard = time;
    }

    /// Delay before an unacknowledged reliable message is sent again.
    pub fn resend_delay(&self) -> Duration {
        RESEND_DELAY_BASE + self.average_rtt.unwrap_or(INITIAL_AVERAGE_ROUND_TRIP_TIME) * 2
    }

    /// Runs one tick: requests, handshake, liveness, then outgoing traffic.
    ///
    /// Queued messages only go out when `flush` is set; resends and
    /// acknowledgments always do.
    pub fn update(&mut self, time: Instant, flush: bool) {
        while let Some(request) = self.handle.next_request() {
            self.process_request(request, time);
        }
        if self.is_disconnected() {
            return;
        }

        self.update_handshake(time);
        self.update_liveness(time);
        if self.is_disconnected() {
            return;
        }

        if self.status == ConnectionStatus::Connected {
            if let Some(size) = self.mtu.poll(time) {
                self.send_mtu_probe(size);
            }
        }

        while let Some(outbound) = self.handle.next_outbound() {
            let Some(index) = outbound.message_type.channel_index() else {
                continue;
            };
            self.sender(outbound.message_type, index).enqueue(outbound.message);
        }

        self.send_channels(time, flush);
        self.send_acknowledgements();
        self.fragments.evict_stale(self.context.pool(), time);
        self.flush_datagram();
        self.handle.store_statistics(self.statistics);
    }

    /// Sends Disconnect and moves to `Disconnected`, as done at peer shutdown.
    pub fn shutdown(&mut self, reason: &str, time: Instant) {
        if !self.is_disconnected() {
            self.disconnect(reason, true, time);
        }
    }

    fn process_request(&mut self, request: ConnectionRequest, time: Instant) {
        match request {
            ConnectionRequest::ResendHandshake => self.resend_handshake(time),
            ConnectionRequest::Approve(hail) => self.approve(hail, time),
            ConnectionRequest::Deny(reason) => {
                if self.status == ConnectionStatus::RespondedAwaitingApproval {
                    self.send_library(LibraryMessage::Disconnect, &encode_payload(&DisconnectPayload { reason: reason.clone() }).0);
                    self.flush_datagram();
                    self.set_status(ConnectionStatus::Disconnected, &reason, time);
                }
            }
            ConnectionRequest::Disconnect(reason) => {
                if !self.status.is_disconnecting() {
                    self.disconnect(&reason, true, time);
                }
            }
        }
    }

    fn update_liveness(&mut self, time: Instant) {
        let timeout = self.context.config().connection_timeout();
        let ping_interval = self.context.config().ping_interval();
        let watched = matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::RespondedAwaitingApproval | ConnectionStatus::ReceivedInitiation
        );
        if watched && time.saturating_duration_since(self.last_heard) > timeout {
            self.log(IncomingMessageKind::Debug(format!("{} timed out", self.handle.remote_address())), time);
            self.disconnect(REASON_TIMED_OUT, true, time);
            return;
        }

        if self.status == ConnectionStatus::Connected {
            let due = self.last_ping.map_or(true, |last| time.saturating_duration_since(last) >= ping_interval);
            if due {
                self.ping_number = self.ping_number.wrapping_add(1);
                self.ping_sent_at = Some(time);
                self.last_ping = Some(time);
                self.send_library(LibraryMessage::Ping, &[self.ping_number]);
            }
        }
    }

    fn on_pong(&mut self, number: u8, time: Instant) {
        let Some(sent_at) = self.ping_sent_at.filter(|_| number == self.ping_number) else {
            return;
        };
        self.ping_sent_at = None;
        let sample = time.saturating_duration_since(sent_at);
        let average = match self.average_rtt {
            Some(average) => average.mul_f64(0.7) + sample.mul_f64(0.3),
            None => sample,
        };
        self.average_rtt = Some(average);
        self.handle.set_average_round_trip_time(average);
        tracing::trace!("RTT to {} is {:?} (average {:?})", self.handle.remote_address(), sample, average);
        let message = IncomingMessage::new(IncomingMessageKind::ConnectionLatencyUpdated(average), time)
            .with_connection(self.handle.clone());
        self.emit(message);
    }

    fn send_mtu_probe(&mut self, size: usize) {
        let payload = sluice_protocol::library::encode_mtu_probe(size);
        let header = MessageHeader {
            message_type: MessageType::Library(LibraryMessage::ExpandMtuRequest),
            is_fragment: false,
            sequence: 0,
            payload_bits: (payload.len() * 8) as u16,
        };
        // A probe must travel alone so its datagram has exactly the probed size.
        self.flush_datagram();
        self.write_message(&header, &payload);
        self.flush_datagram();
    }

    fn on_mtu_success(&mut self, size: usize, time: Instant) {
        if self.mtu.process_success(size, time) {
            self.handle.set_current_mtu(size);
            self.writer.set_mtu(size);
            self.log(
                IncomingMessageKind::Debug(format!("MTU to {} expanded to {}", self.handle.remote_address(), size)),
                time,
            );
        }
    }

    fn sender(&mut self, message_type: MessageType, index: usize) -> &mut SenderChannel {
        let suppress = self.context.config().suppress_unreliable_unordered_acks();
        self.senders[index].get_or_insert_with(|| {
            let (method, channel) = match message_type {
                MessageType::User { method, channel } => (method, channel),
                _ => (DeliveryMethod::Unreliable, 0),
            };
            let flow_control = !(suppress && method == DeliveryMethod::Unreliable);
            SenderChannel::new(method, channel, flow_control)
        })
    }

    fn send_channels(&mut self, time: Instant, flush: bool) {
        let delay = self.resend_delay();
        let mut transmissions = std::mem::take(&mut self.transmissions);
        for index in 0..self.senders.len() {
            let Some(sender) = self.senders[index].as_mut() else {
                continue;
            };
            let resent = sender.resend_due(time, delay, &mut transmissions);
            self.statistics.messages_resent += resent as u64;
            let expired = sender.expire_unacknowledged(time, delay);
            self.handle.release_backlog(index, expired);
            if flush {
                let first = transmissions.len();
                let freed = sender.send_queued(time, &mut transmissions);
                self.statistics.messages_sent += (transmissions.len() - first) as u64;
                self.handle.release_backlog(index, freed);
            }
        }
        for transmission in transmissions.drain(..) {
            self.write_message(&transmission.header, transmission.payload.as_slice());
        }
        self.transmissions = transmissions;
    }

    fn send_acknowledgements(&mut self) {
        if self.pending_acks.is_empty() {
            return;
        }
        let room = self.writer.capacity().saturating_sub(HEADER_BYTE_SIZE);
        let per_message = (room / ACKNOWLEDGEMENT_SIZE).clamp(1, u16::MAX as usize / (8 * ACKNOWLEDGEMENT_SIZE));
        let acks = std::mem::take(&mut self.pending_acks);
        let mut payload = Vec::with_capacity(per_message * ACKNOWLEDGEMENT_SIZE);
        for chunk in acks.chunks(per_message) {
            payload.clear();
            if let Err(error) = encode_acknowledgements(&mut payload, chunk) {
                tracing::error!("Failed to encode acknowledgements: {}", error);
                continue;
            }
            self.send_library(LibraryMessage::Acknowledge, &payload);
        }
        self.pending_acks = acks;
        self.pending_acks.clear();
    }

    fn send_library(&mut self, message: LibraryMessage, payload: &[u8]) {
        let bits = payload.len() * 8;
        if bits > u16::MAX as usize {
            tracing::error!("{:?} payload of {} bytes does not fit a message", message, payload.len());
            return;
        }
        let header = MessageHeader {
            message_type: MessageType::Library(message),
            is_fragment: false,
            sequence: 0,
            payload_bits: bits as u16,
        };
        self.write_message(&header, payload);
    }

    fn write_message(&mut self, header: &MessageHeader, payload: &[u8]) {
        if let Some(datagram) = self.writer.write(header, payload, self.context.pool()) {
            self.push_datagram(datagram);
        }
    }

    fn flush_datagram(&mut self) {
        if let Some(datagram) = self.writer.flush(self.context.pool()) {
            self.push_datagram(datagram);
        }
    }

    fn push_datagram(&mut self, datagram: Vec<u8>) {
        self.statistics.packets_sent += 1;
        self.statistics.bytes_sent += datagram.len() as u64;
        self.actions.push(Action::Send(datagram));
    }

    fn disconnect(&mut self, reason: &str, notify_remote: bool, time: Instant) {
        if notify_remote {
            let (payload, _) = encode_payload(&DisconnectPayload { reason: reason.to_owned() });
            self.send_library(LibraryMessage::Disconnect, &payload);
            self.flush_datagram();
        }
        if self.status == ConnectionStatus::Connected {
            self.set_status(ConnectionStatus::Disconnecting, reason, time);
        }
        self.set_status(ConnectionStatus::Disconnected, reason, time);
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: &str, time: Instant) {
        if self.status == status {
            return;
        }
        tracing::debug!("{} changed status {} -> {} {}", self.handle.remote_address(), self.status, status, reason);
        self.status = status;
        self.handle.set_status(status);

        match status {
            ConnectionStatus::Connected => self.last_ping = None,
            ConnectionStatus::Disconnected => self.release_resources(),
            _ => {}
        }

        let message = IncomingMessage::new(
            IncomingMessageKind::StatusChanged { status, reason: reason.to_owned() },
            time,
        )
        .with_connection(self.handle.clone());
        self.emit(message);
        self.handle.store_statistics(self.statistics);
    }

    fn release_resources(&mut self) {
        let pool = self.context.pool();
        for sender in self.senders.iter_mut().flatten() {
            sender.release(pool);
        }
        while let Some(outbound) = self.handle.next_outbound() {
            outbound.message.payload.release(pool);
        }
        self.receivers.iter_mut().for_each(|receiver| *receiver = None);
        self.fragments.clear(pool);
        self.pending_acks.clear();
    }

    fn emit(&mut self, message: IncomingMessage) {
        if self.context.config().is_message_type_enabled(message.kind().message_type()) {
            self.actions.push(Action::Emit(message));
        } else {
            self.context.pool().release(message.into_storage());
        }
    }

    fn log(&mut self, kind: IncomingMessageKind, time: Instant) {
        match &kind {
            IncomingMessageKind::VerboseDebug(text) => tracing::trace!("{}", text),
            IncomingMessageKind::Debug(text) => tracing::debug!("{}", text),
            IncomingMessageKind::Warning(text) => tracing::warn!("{}", text),
            IncomingMessageKind::Error(text) => tracing::error!("{}", text),
            _ => {}
        }
        let message = IncomingMessage::new(kind, time).with_connection(self.handle.clone());
        self.emit(message);
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("remote", &self.handle.remote_address())
            .field("status", &self.status)
            .field("average_rtt", &self.average_rtt)
            .field("fragment_groups", &self.fragments.len())
            .finish()
    }
}
