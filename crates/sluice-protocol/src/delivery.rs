//! Delivery methods and the message type byte that leads every wire message.
//!
//! The delivery method values leave room for a channel offset, so the first header
//! byte of a user message is simply `method as u8 + channel`.

use std::convert::TryFrom;

use sluice_core::{
    constants::{
        CHANNELS_PER_DELIVERY_METHOD, DEFAULT_WINDOW_SIZE, RELIABLE_ORDERED_WINDOW_SIZE,
        RELIABLE_SEQUENCED_WINDOW_SIZE, UNRELIABLE_WINDOW_SIZE,
    },
    error::{DecodingErrorKind, ErrorKind},
};

/// Helper trait to convert enums to u8 values for wire format.
pub trait EnumConverter {
    /// Converts the enum to a u8 for serialization.
    fn to_u8(&self) -> u8;
}

/// How a user message travels to its recipient.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMethod {
    /// No guarantees; duplicates and reordering are possible.
    Unreliable = 1,
    /// Late messages (older than the newest seen on the channel) are dropped.
    UnreliableSequenced = 2,
    /// Every message arrives exactly once, in any order.
    ReliableUnordered = 34,
    /// Every message is sent until acknowledged; late arrivals are dropped.
    ReliableSequenced = 35,
    /// Every message arrives exactly once, in send order per channel.
    ReliableOrdered = 67,
}

impl DeliveryMethod {
    /// Every method, in wire order.
    pub const ALL: [DeliveryMethod; 5] = [
        DeliveryMethod::Unreliable,
        DeliveryMethod::UnreliableSequenced,
        DeliveryMethod::ReliableUnordered,
        DeliveryMethod::ReliableSequenced,
        DeliveryMethod::ReliableOrdered,
    ];

    /// Whether messages are resent until acknowledged.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }

    /// Number of independent sequence channels for this method.
    pub fn channel_count(self) -> u8 {
        match self {
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => 1,
            _ => CHANNELS_PER_DELIVERY_METHOD,
        }
    }

    /// Slots in the send and receive windows of one channel.
    pub fn window_size(self) -> usize {
        match self {
            DeliveryMethod::Unreliable | DeliveryMethod::UnreliableSequenced => {
                UNRELIABLE_WINDOW_SIZE
            }
            DeliveryMethod::ReliableOrdered => RELIABLE_ORDERED_WINDOW_SIZE,
            DeliveryMethod::ReliableSequenced => RELIABLE_SEQUENCED_WINDOW_SIZE,
            DeliveryMethod::ReliableUnordered => DEFAULT_WINDOW_SIZE,
        }
    }
}

impl EnumConverter for DeliveryMethod {
    fn to_u8(&self) -> u8 {
        *self as u8
    }
}

/// Library messages exchanged by the transport itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LibraryMessage {
    /// Liveness probe carrying a ping number.
    Ping = 129,
    /// Answer to a ping.
    Pong = 130,
    /// First handshake message from the initiator.
    Connect = 131,
    /// Responder's answer to `Connect`.
    ConnectResponse = 132,
    /// Initiator's confirmation that completes the handshake.
    ConnectionEstablished = 133,
    /// Batch of (message type, sequence) acknowledgments.
    Acknowledge = 134,
    /// Connection teardown with a reason string.
    Disconnect = 135,
    /// Request for servers to identify themselves.
    Discovery = 136,
    /// Server answer to `Discovery`.
    DiscoveryResponse = 137,
    /// Padded probe testing a larger MTU.
    ExpandMtuRequest = 140,
    /// Confirms a probe size arrived.
    ExpandMtuSuccess = 141,
}

impl EnumConverter for LibraryMessage {
    fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for LibraryMessage {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            129 => LibraryMessage::Ping,
            130 => LibraryMessage::Pong,
            131 => LibraryMessage::Connect,
            132 => LibraryMessage::ConnectResponse,
            133 => LibraryMessage::ConnectionEstablished,
            134 => LibraryMessage::Acknowledge,
            135 => LibraryMessage::Disconnect,
            136 => LibraryMessage::Discovery,
            137 => LibraryMessage::DiscoveryResponse,
            140 => LibraryMessage::ExpandMtuRequest,
            141 => LibraryMessage::ExpandMtuSuccess,
            _ => return Err(DecodingErrorKind::MessageType(value).into()),
        })
    }
}

/// Decoded first header byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Application data sent without a connection.
    Unconnected,
    /// Application data on a delivery method and channel.
    User {
        /// Delivery method.
        method: DeliveryMethod,
        /// Sequence channel within the method.
        channel: u8,
    },
    /// Transport-internal message.
    Library(LibraryMessage),
}

impl MessageType {
    /// Builds a user message type, or `None` when the channel does not exist for the method.
    pub fn user(method: DeliveryMethod, channel: u8) -> Option<Self> {
        (channel < method.channel_count()).then_some(MessageType::User { method, channel })
    }

    /// Index of the user channel in `0..NUM_TOTAL_CHANNELS`.
    pub fn channel_index(self) -> Option<usize> {
        match self {
            MessageType::User { .. } => Some(self.to_u8() as usize - 1),
            _ => None,
        }
    }
}

impl EnumConverter for MessageType {
    fn to_u8(&self) -> u8 {
        match self {
            MessageType::Unconnected => 0,
            MessageType::User { method, channel } => method.to_u8() + channel,
            MessageType::Library(library) => library.to_u8(),
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let user = |method: DeliveryMethod| MessageType::User { method, channel: value - method.to_u8() };
        Ok(match value {
            0 => MessageType::Unconnected,
            1 => user(DeliveryMethod::Unreliable),
            2..=33 => user(DeliveryMethod::UnreliableSequenced),
            34 => user(DeliveryMethod::ReliableUnordered),
            35..=66 => user(DeliveryMethod::ReliableSequenced),
            67..=98 => user(DeliveryMethod::ReliableOrdered),
            _ => MessageType::Library(LibraryMessage::try_from(value)?),
        })
    }
}
