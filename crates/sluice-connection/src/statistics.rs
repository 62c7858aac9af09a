//! Connection statistics tracking.
//!
//! Counters are updated by the network thread and copied out to application
//! threads through the connection handle, so reading them never blocks a send.

/// Traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    /// Datagrams sent to the remote endpoint
    pub packets_sent: u64,
    /// Datagrams received from the remote endpoint
    pub packets_received: u64,
    /// Datagram bytes sent, headers included
    pub bytes_sent: u64,
    /// Datagram bytes received, headers included
    pub bytes_received: u64,
    /// User messages (or fragments) put on the wire for the first time
    pub messages_sent: u64,
    /// User messages (or fragments) accepted by a receiver channel
    pub messages_received: u64,
    /// Reliable messages transmitted again after their resend delay elapsed
    pub messages_resent: u64,
    /// Incoming messages dropped as duplicates, stale sequence numbers or malformed
    pub messages_dropped: u64,
}

impl ConnectionStatistics {
    /// Share of first transmissions that needed a resend (0.0 to 1.0 for a healthy link).
    pub fn resend_rate(&self) -> f32 {
        if self.messages_sent == 0 {
            return 0.0;
        }
        self.messages_resent as f32 / self.messages_sent as f32
    }

    /// Adds every counter of `other` to `self`.
    pub fn accumulate(&mut self, other: &ConnectionStatistics) {
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.messages_resent += other.messages_resent;
        self.messages_dropped += other.messages_dropped;
    }

    /// Resets all statistics counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
