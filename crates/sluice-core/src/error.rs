use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The configuration was rejected when it was built.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Socket or OS level failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A read asked for more bits than the buffer holds.
    #[error("buffer underrun: needed {needed} bits but only {remaining} remain")]
    BufferUnderrun {
        /// Bits requested by the read.
        needed: usize,
        /// Bits left past the read cursor.
        remaining: usize,
    },
    /// Wire data could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingErrorKind),
    /// The peer has not been started or has already shut down.
    #[error("peer is not running")]
    NotRunning,
    /// `start` was called twice.
    #[error("peer is already running")]
    AlreadyRunning,
    /// A client already has a live or pending server connection.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    /// The connection table is at `maximum_connections`.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// Host name resolution produced no address.
    #[error("could not resolve host {0}")]
    UnresolvedHost(String),
}

/// Reasons a `ConfigBuilder` refuses to build.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The application identifier must be non-empty.
    #[error("application identifier must not be empty")]
    EmptyAppIdentifier,
    /// MTU must lie in `1..=PROTOCOL_MAX_MTU`.
    #[error("maximum transmission unit {0} is outside 1..={1}")]
    InvalidMtu(usize, usize),
    /// Connection timeout must be at least the ping interval.
    #[error("connection timeout {timeout:?} is shorter than ping interval {ping_interval:?}")]
    TimeoutBelowPingInterval {
        /// Configured connection timeout.
        timeout: Duration,
        /// Configured ping interval.
        ping_interval: Duration,
    },
    /// At least one handshake attempt is required.
    #[error("maximum handshake attempts must be at least 1")]
    NoHandshakeAttempts,
    /// Maximum connections must be at least 1.
    #[error("maximum connections must be at least 1")]
    NoConnectionsAllowed,
    /// Maximum message size must lie in `1..=MAX_MESSAGE_SIZE`.
    #[error("maximum message size {0} is outside 1..={1}")]
    InvalidMessageSize(usize, usize),
    /// At least one fragment group must be allowed.
    #[error("maximum fragment groups must be at least 1")]
    NoFragmentGroups,
    /// A probability setting was outside `0.0..=1.0`.
    #[error("{0} must be between 0.0 and 1.0")]
    InvalidProbability(&'static str),
}

/// Reasons wire data is rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// The message type byte has no meaning.
    #[error("unknown message type {0}")]
    MessageType(u8),
    /// Fewer than five bytes remained for a header.
    #[error("truncated message header")]
    TruncatedHeader,
    /// The header declared more payload than the datagram carries.
    #[error("payload of {declared} bytes exceeds the {available} remaining in the datagram")]
    PayloadOverrun {
        /// Bytes declared by the header.
        declared: usize,
        /// Bytes left in the datagram.
        available: usize,
    },
    /// A string field was not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidString,
    /// A variable-length integer ran past its maximum width.
    #[error("malformed variable-length integer")]
    VarInt,
    /// A fragment header contradicts itself.
    #[error("inconsistent fragment header")]
    Fragment,
    /// The CRC32 trailer did not match.
    #[error("checksum mismatch")]
    Checksum,
    /// An enumeration byte was out of range.
    #[error("invalid value {value} for {kind}")]
    InvalidValue {
        /// Enumeration being decoded.
        kind: &'static str,
        /// Offending byte.
        value: u8,
    },
}
