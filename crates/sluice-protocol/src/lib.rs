#![warn(missing_docs)]

//! sluice-protocol: wire format shared by both ends of a connection.
//!
//! A datagram carries one or more messages back to back, optionally followed by a
//! CRC32 trailer. Every message starts with the five-byte [`MessageHeader`].

/// Optional CRC32 datagram trailer.
pub mod checksum;
/// Delivery methods and message type bytes.
pub mod delivery;
/// Fragment header and payload splitting.
pub mod fragment;
/// Message header codec.
pub mod header;
/// Library message payloads.
pub mod library;
/// Outgoing application messages.
pub mod outgoing;
/// Sequence number arithmetic.
pub mod sequence;
/// Connection status enumeration.
pub mod status;

pub use delivery::{DeliveryMethod, EnumConverter, LibraryMessage, MessageType};
pub use fragment::{FragmentGroupIds, FragmentHeader};
pub use header::MessageHeader;
pub use library::Acknowledgement;
pub use outgoing::OutgoingMessage;
pub use sequence::SequenceNumber;
pub use status::ConnectionStatus;
