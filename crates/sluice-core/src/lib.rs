#![warn(missing_docs)]

//! sluice-core: foundational types shared by every layer.
//!
//! This crate provides the building blocks the rest of the workspace depends on:
//! - Wire constants
//! - Configuration (builder + immutable `Config`)
//! - Error handling
//! - The bit-addressable `BitBuffer` and its explicit encode/decode traits
//! - The fixed-capacity `AckWindow` bitset
//! - Message buffer pooling
//!
//! Wire encoding lives in `sluice-protocol`, connection state in `sluice-connection`
//! and the socket/thread owner in `sluice-peer`.

/// Protocol constants shared across layers.
pub mod constants {
    /// Size of the per-message header: type byte, sequence word and bit-length word.
    pub const HEADER_BYTE_SIZE: usize = 5;
    /// Sequence numbers are drawn from this modulus.
    pub const NUM_SEQUENCE_NUMBERS: u16 = 1024;
    /// Half of the sequence space; "newer than" is only meaningful within this distance.
    pub const HALF_SEQUENCE_SPACE: i32 = (NUM_SEQUENCE_NUMBERS / 2) as i32;
    /// Number of sequence channels available to each sequenced delivery method.
    pub const CHANNELS_PER_DELIVERY_METHOD: u8 = 32;
    /// Number of distinct user message types (unreliable through the last ordered channel).
    pub const NUM_TOTAL_CHANNELS: usize = 98;
    /// Window size of reliable ordered channels.
    pub const RELIABLE_ORDERED_WINDOW_SIZE: usize = 64;
    /// Window size of reliable sequenced channels.
    pub const RELIABLE_SEQUENCED_WINDOW_SIZE: usize = 64;
    /// Window size of reliable unordered channels.
    pub const DEFAULT_WINDOW_SIZE: usize = 64;
    /// Window size of unreliable and unreliable sequenced channels.
    pub const UNRELIABLE_WINDOW_SIZE: usize = 128;
    /// Fragment group ids run from 1 up to this value and then wrap.
    pub const MAX_FRAGMENTATION_GROUPS: u32 = 65534;
    /// Default maximum transmission unit.
    ///
    /// Derived from ethernet_mtu - ipv4 worst case - udp_header_size - slack
    ///       1408 = 1500         - 60              - 8               - 24
    pub const DEFAULT_MTU: usize = 1408;
    /// Largest MTU the protocol can describe; payload bit lengths travel in 16 bits.
    pub const PROTOCOL_MAX_MTU: usize = (u16::MAX as usize + 1) / 8 - 1;
    /// Largest message a fragment header can describe; total bit lengths travel in 32 bits.
    pub const MAX_MESSAGE_SIZE: usize = u32::MAX as usize / 8;
    /// Storage grows by this many bytes past the requested size to amortize resizes.
    pub const BUFFER_OVERALLOCATE_AMOUNT: usize = 4;
    /// Size of the optional CRC32 datagram trailer.
    pub const CHECKSUM_SIZE: usize = 4;
}

/// Fixed-capacity bitset tracking window slots.
pub mod ack_window;
/// Bit-addressable growable buffer.
pub mod bit_buffer;
/// Configuration builder and immutable configuration.
pub mod config;
/// Error types and results.
pub mod error;
/// Message buffer pooling for allocation-free steady state.
pub mod message_pool;
/// Enable mask for incoming message kinds.
pub mod message_types;
/// Transport abstraction for pluggable I/O.
pub mod transport;

pub use ack_window::AckWindow;
pub use bit_buffer::{BitBuffer, Decode, Encode};
pub use config::{Config, ConfigBuilder, UnreliableSizeBehaviour};
pub use error::{ConfigError, DecodingErrorKind, ErrorKind, Result};
pub use message_pool::{MessagePool, SharedPayload};
pub use message_types::MessageTypes;
