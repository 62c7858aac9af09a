//! Peer-wide statistics.
//!
//! Datagram counters are taken at the socket, so they include handshake,
//! unconnected and discovery traffic. Message counters are the sum over every
//! connection the peer has had since it started.

use sluice_connection::ConnectionStatistics;

/// Traffic counters for a whole peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    /// Datagrams written to the socket
    pub packets_sent: u64,
    /// Datagrams read from the socket
    pub packets_received: u64,
    /// Bytes written to the socket
    pub bytes_sent: u64,
    /// Bytes read from the socket
    pub bytes_received: u64,
    /// User messages put on the wire for the first time
    pub messages_sent: u64,
    /// User messages accepted by a receiver channel
    pub messages_received: u64,
    /// Reliable messages sent again
    pub messages_resent: u64,
    /// Incoming messages dropped as duplicates, late or malformed
    pub messages_dropped: u64,
    /// Connections currently held, handshakes included
    pub active_connections: usize,
}

impl PeerStatistics {
    /// Adds the message counters of one connection.
    pub fn add_connection(&mut self, connection: &ConnectionStatistics) {
        self.messages_sent += connection.messages_sent;
        self.messages_received += connection.messages_received;
        self.messages_resent += connection.messages_resent;
        self.messages_dropped += connection.messages_dropped;
    }

    /// Share of first transmissions that needed a resend.
    pub fn resend_rate(&self) -> f32 {
        if self.messages_sent == 0 {
            return 0.0;
        }
        self.messages_resent as f32 / self.messages_sent as f32
    }
}
