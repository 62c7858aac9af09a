//! Messages released to the application.

use std::{
    net::SocketAddr,
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use sluice_core::{bit_buffer::BitBuffer, message_types::MessageTypes};
use sluice_protocol::{delivery::DeliveryMethod, status::ConnectionStatus};

use crate::handle::Connection;

/// What an incoming message is.
///
/// Each case corresponds to exactly one flag of [`MessageTypes`]; a kind is only
/// released when its flag is enabled in the configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessageKind {
    /// The connection changed status.
    StatusChanged {
        /// New status.
        status: ConnectionStatus,
        /// Reason given for a disconnect, empty otherwise.
        reason: String,
    },
    /// Application data sent without a connection.
    UnconnectedData,
    /// An inbound connection waits for `approve` or `deny`; the body holds the remote hail.
    ConnectionApproval,
    /// Application data from a connection.
    Data,
    /// A reliable message sent with this receipt tag was fully acknowledged.
    Receipt(u32),
    /// A remote peer is looking for servers; answer with `send_discovery_response`.
    DiscoveryRequest,
    /// A server answered a discovery request; the body holds its response.
    DiscoveryResponse,
    /// Very chatty internal diagnostics.
    VerboseDebug(String),
    /// Internal diagnostics.
    Debug(String),
    /// Internal warnings.
    Warning(String),
    /// Internal errors.
    Error(String),
    /// The average round-trip time was updated.
    ConnectionLatencyUpdated(Duration),
}

impl IncomingMessageKind {
    /// The capability flag controlling whether this kind is released.
    pub fn message_type(&self) -> MessageTypes {
        match self {
            IncomingMessageKind::StatusChanged { .. } => MessageTypes::STATUS_CHANGED,
            IncomingMessageKind::UnconnectedData => MessageTypes::UNCONNECTED_DATA,
            IncomingMessageKind::ConnectionApproval => MessageTypes::CONNECTION_APPROVAL,
            IncomingMessageKind::Data => MessageTypes::DATA,
            IncomingMessageKind::Receipt(_) => MessageTypes::RECEIPT,
            IncomingMessageKind::DiscoveryRequest => MessageTypes::DISCOVERY_REQUEST,
            IncomingMessageKind::DiscoveryResponse => MessageTypes::DISCOVERY_RESPONSE,
            IncomingMessageKind::VerboseDebug(_) => MessageTypes::VERBOSE_DEBUG,
            IncomingMessageKind::Debug(_) => MessageTypes::DEBUG,
            IncomingMessageKind::Warning(_) => MessageTypes::WARNING,
            IncomingMessageKind::Error(_) => MessageTypes::ERROR,
            IncomingMessageKind::ConnectionLatencyUpdated(_) => MessageTypes::CONNECTION_LATENCY_UPDATED,
        }
    }
}

/// A message released by the network thread.
///
/// Dereferences to [`BitBuffer`] for reading the body. Hand it back with
/// `Peer::recycle` when done so its storage can be reused.
#[derive(Debug)]
pub struct IncomingMessage {
    kind: IncomingMessageKind,
    buffer: BitBuffer,
    sender: Option<SocketAddr>,
    connection: Option<Connection>,
    delivery: Option<(DeliveryMethod, u8)>,
    received_at: Instant,
    is_fragment: bool,
}

impl IncomingMessage {
    /// Creates a message with an empty body.
    pub fn new(kind: IncomingMessageKind, received_at: Instant) -> Self {
        Self {
            kind,
            buffer: BitBuffer::new(),
            sender: None,
            connection: None,
            delivery: None,
            received_at,
            is_fragment: false,
        }
    }

    /// Sets the body.
    pub fn with_body(mut self, buffer: BitBuffer) -> Self {
        self.buffer = buffer;
        self
    }

    /// Sets the sending endpoint.
    pub fn with_sender(mut self, sender: SocketAddr) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Sets the connection (and sending endpoint) the message belongs to.
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.sender = Some(connection.remote_address());
        self.connection = Some(connection);
        self
    }

    /// Records the delivery method and channel data arrived on.
    pub fn with_delivery(mut self, method: DeliveryMethod, channel: u8, is_fragment: bool) -> Self {
        self.delivery = Some((method, channel));
        self.is_fragment = is_fragment;
        self
    }

    /// What this message is.
    pub fn kind(&self) -> &IncomingMessageKind {
        &self.kind
    }

    /// Endpoint the message came from, if any.
    pub fn sender(&self) -> Option<SocketAddr> {
        self.sender
    }

    /// Connection the message belongs to, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Delivery method data arrived with.
    pub fn delivery_method(&self) -> Option<DeliveryMethod> {
        self.delivery.map(|(method, _)| method)
    }

    /// Sequence channel data arrived on.
    pub fn channel(&self) -> Option<u8> {
        self.delivery.map(|(_, channel)| channel)
    }

    /// When the network thread received (or, for fragments, completed) the message.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Returns true if the body was reassembled from fragments.
    pub fn is_fragment(&self) -> bool {
        self.is_fragment
    }

    /// Gives up the body storage for recycling.
    pub fn into_storage(self) -> Vec<u8> {
        self.buffer.into_bytes()
    }
}

impl Deref for IncomingMessage {
    type Target = BitBuffer;

    fn deref(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl DerefMut for IncomingMessage {
    fn deref_mut(&mut self) -> &mut BitBuffer {
        &mut self.buffer
    }
}
