//! Application-side handle of a connection.
//!
//! The network thread is the only owner of a connection's reliability state. The
//! [`Connection`] handle given to application threads shares a small set of
//! atomics with it (status, round-trip time, MTU, per-channel backlog) and talks to
//! it through two queues: outbound messages and lifecycle requests.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use sluice_core::{
    config::UnreliableSizeBehaviour,
    constants::{HEADER_BYTE_SIZE, NUM_TOTAL_CHANNELS},
    message_pool::SharedPayload,
};
use sluice_protocol::{
    delivery::{DeliveryMethod, MessageType},
    fragment::split_payload,
    outgoing::OutgoingMessage,
    status::ConnectionStatus,
};

use crate::{
    channel::{QueuedMessage, ReceiptTracker},
    context::PeerContext,
    statistics::ConnectionStatistics,
};

const UNKNOWN_RTT: u64 = u64::MAX;

/// Outcome of a send call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The message was accepted for sending.
    Sent,
    /// The channel's window is full; the message was dropped. Retry once an
    /// acknowledgment frees a slot (see [`Connection::can_send`]).
    QueueFull,
    /// The connection is not in the `Connected` state.
    NotConnected,
    /// The message cannot be sent under the configured size policy.
    MessageTooLarge,
}

/// Lifecycle request from an application thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRequest {
    /// Send the current handshake message again right away.
    ResendHandshake,
    /// Accept an inbound connection, answering with this hail.
    Approve(Vec<u8>),
    /// Refuse an inbound connection.
    Deny(String),
    /// Close the connection.
    Disconnect(String),
}

/// A message on its way from an application thread to a channel.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Channel to send on.
    pub message_type: MessageType,
    /// The message or fragment.
    pub message: QueuedMessage,
}

struct Shared {
    remote: SocketAddr,
    context: Arc<PeerContext>,
    status: AtomicU8,
    visible_status: AtomicU8,
    average_rtt_micros: AtomicU64,
    mtu: AtomicUsize,
    remote_unique_identifier: AtomicU64,
    remote_hail: Mutex<Option<Vec<u8>>>,
    backlog: Vec<AtomicUsize>,
    outbound: (Sender<OutboundMessage>, Receiver<OutboundMessage>),
    requests: (Sender<ConnectionRequest>, Receiver<ConnectionRequest>),
    statistics: Mutex<ConnectionStatistics>,
}

/// Shared handle to one connection.
///
/// Cheap to clone; every clone refers to the same connection. Two handles compare
/// equal when they refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates the handle for a connection to `remote`.
    pub fn new(remote: SocketAddr, context: Arc<PeerContext>) -> Self {
        let mtu = context.config().maximum_transmission_unit();
        Self {
            shared: Arc::new(Shared {
                remote,
                context,
                status: AtomicU8::new(ConnectionStatus::None as u8),
                visible_status: AtomicU8::new(ConnectionStatus::None as u8),
                average_rtt_micros: AtomicU64::new(UNKNOWN_RTT),
                mtu: AtomicUsize::new(mtu),
                remote_unique_identifier: AtomicU64::new(0),
                remote_hail: Mutex::new(None),
                backlog: (0..NUM_TOTAL_CHANNELS).map(|_| AtomicUsize::new(0)).collect(),
                outbound: unbounded(),
                requests: unbounded(),
                statistics: Mutex::new(ConnectionStatistics::default()),
            }),
        }
    }

    /// Remote endpoint.
    pub fn remote_address(&self) -> SocketAddr {
        self.shared.remote
    }

    /// Current status as seen by the network thread.
    pub fn status(&self) -> ConnectionStatus {
        decode_status(self.shared.status.load(Ordering::Acquire))
    }

    /// Status of the last `StatusChanged` message the application read.
    pub fn visible_status(&self) -> ConnectionStatus {
        decode_status(self.shared.visible_status.load(Ordering::Acquire))
    }

    /// Smoothed round-trip time, once a ping has been answered.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        match self.shared.average_rtt_micros.load(Ordering::Acquire) {
            UNKNOWN_RTT => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Hail the remote peer sent during the handshake.
    pub fn remote_hail(&self) -> Option<Vec<u8>> {
        self.shared.remote_hail.lock().clone()
    }

    /// Unique identifier of the remote peer, zero until the handshake delivered it.
    pub fn remote_unique_identifier(&self) -> u64 {
        self.shared.remote_unique_identifier.load(Ordering::Acquire)
    }

    /// Datagram size limit currently used for this connection.
    pub fn current_mtu(&self) -> usize {
        self.shared.mtu.load(Ordering::Acquire)
    }

    /// Snapshot of the traffic counters.
    pub fn statistics(&self) -> ConnectionStatistics {
        *self.shared.statistics.lock()
    }

    /// Returns true if a send on `method`/`channel` would not be refused as `QueueFull`.
    pub fn can_send(&self, method: DeliveryMethod, channel: u8) -> bool {
        match MessageType::user(method, channel).and_then(MessageType::channel_index) {
            Some(index) => self.shared.backlog[index].load(Ordering::Acquire) < method.window_size(),
            None => false,
        }
    }

    /// Sends `message` to the remote peer.
    pub fn send_message(&self, message: OutgoingMessage, method: DeliveryMethod, channel: u8) -> SendResult {
        let context = self.shared.context.clone();
        send_to_connections(&context, message, std::slice::from_ref(self), method, channel)
    }

    /// Accepts an inbound connection waiting for approval.
    pub fn approve(&self) {
        self.request(ConnectionRequest::Approve(Vec::new()));
    }

    /// Accepts an inbound connection, sending `hail` back to the initiator.
    pub fn approve_with_hail(&self, hail: OutgoingMessage) {
        let (payload, _) = hail.into_payload();
        self.request(ConnectionRequest::Approve(payload.as_slice().to_vec()));
    }

    /// Refuses an inbound connection waiting for approval.
    pub fn deny(&self, reason: &str) {
        self.request(ConnectionRequest::Deny(reason.to_owned()));
    }

    /// Closes the connection, telling the remote peer `reason`.
    pub fn disconnect(&self, reason: &str) {
        self.request(ConnectionRequest::Disconnect(reason.to_owned()));
    }

    /// Asks the network thread to repeat the current handshake message.
    pub fn request_handshake_resend(&self) {
        self.request(ConnectionRequest::ResendHandshake);
    }

    fn request(&self, request: ConnectionRequest) {
        // The receiver lives in `Shared`, so the channel cannot be disconnected.
        let _ = self.shared.requests.0.send(request);
    }

    /// Next pending lifecycle request, if any.
    pub fn next_request(&self) -> Option<ConnectionRequest> {
        self.shared.requests.1.try_recv().ok()
    }

    /// Next message handed over by an application thread, if any.
    pub fn next_outbound(&self) -> Option<OutboundMessage> {
        self.shared.outbound.1.try_recv().ok()
    }

    /// Publishes the network thread's status.
    pub fn set_status(&self, status: ConnectionStatus) {
        self.shared.status.store(status as u8, Ordering::Release);
    }

    /// Records the status of a `StatusChanged` message the application read.
    pub fn set_visible_status(&self, status: ConnectionStatus) {
        self.shared.visible_status.store(status as u8, Ordering::Release);
    }

    /// Publishes a new round-trip average.
    pub fn set_average_round_trip_time(&self, rtt: Duration) {
        let micros = (rtt.as_micros() as u64).min(UNKNOWN_RTT - 1);
        self.shared.average_rtt_micros.store(micros, Ordering::Release);
    }

    /// Publishes a new MTU.
    pub fn set_current_mtu(&self, mtu: usize) {
        self.shared.mtu.store(mtu, Ordering::Release);
    }

    /// Records what the remote peer sent in its handshake.
    pub fn set_remote_identity(&self, unique_identifier: u64, hail: Vec<u8>) {
        self.shared.remote_unique_identifier.store(unique_identifier, Ordering::Release);
        *self.shared.remote_hail.lock() = Some(hail);
    }

    /// Publishes the network thread's counters.
    pub fn store_statistics(&self, statistics: ConnectionStatistics) {
        *self.shared.statistics.lock() = statistics;
    }

    /// Returns `count` window slots of channel `index` to the application.
    pub fn release_backlog(&self, index: usize, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self.shared.backlog[index]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(count)));
    }

    fn try_reserve(&self, index: usize, window_size: usize, parts: usize) -> bool {
        self.shared.backlog[index]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < window_size).then_some(n + parts))
            .is_ok()
    }

    fn push_outbound(&self, message: OutboundMessage) {
        let _ = self.shared.outbound.0.send(message);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.shared.remote)
            .field("status", &self.status())
            .finish()
    }
}

fn decode_status(value: u8) -> ConnectionStatus {
    ConnectionStatus::try_from(value).unwrap_or(ConnectionStatus::None)
}

/// Sends one message to every connected recipient.
///
/// The message is split into fragments once (sized for the smallest recipient MTU)
/// and the same fragment payloads are shared by every recipient. Returns
/// `QueueFull` if any recipient's window was full, `NotConnected` if no recipient
/// is connected, and `Sent` otherwise.
pub fn send_to_connections(
    context: &PeerContext,
    message: OutgoingMessage,
    recipients: &[Connection],
    method: DeliveryMethod,
    channel: u8,
) -> SendResult {
    let pool = context.pool();
    let message_type = match MessageType::user(method, channel) {
        Some(message_type) => message_type,
        None => {
            debug_assert!(false, "channel {} does not exist for {:?}", channel, method);
            tracing::error!("Channel {} does not exist for {:?}, using the last one", channel, method);
            MessageType::User { method, channel: method.channel_count() - 1 }
        }
    };
    let Some(index) = message_type.channel_index() else {
        return SendResult::NotConnected;
    };

    let (payload, receipt) = message.into_payload();
    let connected: Vec<&Connection> = recipients.iter().filter(|c| c.status().is_connected()).collect();
    if connected.is_empty() {
        payload.release(pool);
        return SendResult::NotConnected;
    }

    if payload.len() > context.config().maximum_message_size() {
        payload.release(pool);
        return SendResult::MessageTooLarge;
    }

    let mtu = connected
        .iter()
        .map(|c| c.current_mtu())
        .min()
        .unwrap_or_else(|| context.config().maximum_transmission_unit());
    let fragment = if HEADER_BYTE_SIZE + payload.len() <= mtu {
        false
    } else if method.is_reliable() {
        true
    } else {
        match context.config().unreliable_size_behaviour() {
            UnreliableSizeBehaviour::NormalFragmentation => true,
            UnreliableSizeBehaviour::IgnoreMtu => false,
            UnreliableSizeBehaviour::DropAboveMtu => {
                payload.release(pool);
                return SendResult::MessageTooLarge;
            }
        }
    };
    if !fragment && payload.length_bits() > u16::MAX as usize {
        payload.release(pool);
        return SendResult::MessageTooLarge;
    }

    let parts: Vec<SharedPayload> = if fragment {
        let fragments = split_payload(&payload, context.next_fragment_group(), mtu, pool);
        payload.release(pool);
        fragments
    } else {
        vec![payload]
    };

    let mut result = SendResult::Sent;
    for connection in connected {
        if !connection.try_reserve(index, method.window_size(), parts.len()) {
            result = SendResult::QueueFull;
            continue;
        }
        let tracker = receipt
            .filter(|_| method.is_reliable())
            .map(|tag| ReceiptTracker::new(tag, parts.len()));
        for part in &parts {
            connection.push_outbound(OutboundMessage {
                message_type,
                message: QueuedMessage { payload: part.clone(), is_fragment: fragment, receipt: tracker.clone() },
            });
        }
    }
    for part in parts {
        part.release(pool);
    }
    result
}
