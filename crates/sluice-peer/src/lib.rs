#![warn(missing_docs)]

//! sluice-peer: the socket owner.
//!
//! A [`Peer`] binds one UDP socket and runs one network thread over it. The
//! thread is the only mutator of connection state; application threads talk to
//! it through queues and read shared snapshots. [`Server`] and [`Client`] are thin
//! wrappers for the two common topologies.

/// Client wrapper with a single server connection.
pub mod client;
mod network;
/// Peer, its lifecycle and application-facing API.
pub mod peer;
/// Server wrapper with broadcast helpers.
pub mod server;
/// UDP transport and link conditioner.
pub mod socket;
/// Peer-wide traffic counters.
pub mod statistics;
/// Time source for the network thread.
pub mod time;

pub use client::Client;
pub use network::REASON_SERVER_FULL;
pub use peer::{Peer, PeerStatus, REASON_PEER_DROPPED};
pub use server::Server;
pub use socket::{LinkConditioner, UdpTransport};
pub use statistics::PeerStatistics;
pub use time::{Clock, SystemClock};
