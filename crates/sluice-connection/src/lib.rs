#![warn(missing_docs)]

//! sluice-connection: everything that happens per remote endpoint.
//!
//! A connection has two halves. The [`Connection`] handle is shared with the
//! application: it reads atomically published status and statistics, and hands
//! messages and requests to the network thread over lock-free queues. The
//! [`ConnectionState`] is owned by the network thread and runs the handshake,
//! the sequence channels, acknowledgments, resends, pings, MTU expansion and
//! fragment reassembly.

/// Per-channel send and receive windows.
pub mod channel;
/// State shared by every connection of a peer.
pub mod context;
/// Packing of messages into datagrams.
pub mod datagram;
/// Reassembly of fragmented messages.
pub mod fragment_group;
/// Application-side connection handle.
pub mod handle;
/// Messages released to the application.
pub mod incoming;
/// Path MTU expansion search.
pub mod mtu_expansion;
/// Network-thread connection state machine.
pub mod state;
/// Traffic counters.
pub mod statistics;

pub use context::PeerContext;
pub use handle::{send_to_connections, Connection, ConnectionRequest, SendResult};
pub use incoming::{IncomingMessage, IncomingMessageKind};
pub use state::{Action, ConnectionState};
pub use statistics::ConnectionStatistics;
