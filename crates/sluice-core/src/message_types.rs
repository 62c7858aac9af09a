use std::{fmt, ops::BitOr};

/// Set of incoming message kinds the application wants released to it.
///
/// This is a capability mask only. Dispatch on a received message happens on the
/// closed `IncomingMessageKind` enum in `sluice-connection`, which maps each case
/// back to one of these flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageTypes(u32);

impl MessageTypes {
    /// Connection status transitions.
    pub const STATUS_CHANGED: Self = Self(1 << 0);
    /// Data sent without a connection.
    pub const UNCONNECTED_DATA: Self = Self(1 << 1);
    /// Inbound connection waiting for `approve`/`deny`.
    pub const CONNECTION_APPROVAL: Self = Self(1 << 2);
    /// Application data from a connection.
    pub const DATA: Self = Self(1 << 3);
    /// Delivery receipts for tagged reliable messages.
    pub const RECEIPT: Self = Self(1 << 4);
    /// A remote peer is looking for servers.
    pub const DISCOVERY_REQUEST: Self = Self(1 << 5);
    /// A server answered our discovery request.
    pub const DISCOVERY_RESPONSE: Self = Self(1 << 6);
    /// Very chatty internal diagnostics.
    pub const VERBOSE_DEBUG: Self = Self(1 << 7);
    /// Internal diagnostics.
    pub const DEBUG: Self = Self(1 << 8);
    /// Internal warnings.
    pub const WARNING: Self = Self(1 << 9);
    /// Internal errors.
    pub const ERROR: Self = Self(1 << 10);
    /// A round-trip time measurement was updated.
    pub const CONNECTION_LATENCY_UPDATED: Self = Self(1 << 12);

    const ALL_BITS: u32 = 0b1_0111_1111_1111;

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every kind.
    pub const fn all() -> Self {
        Self(Self::ALL_BITS)
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every kind in `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds the kinds in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes the kinds in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Returns true if no kind is enabled.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for MessageTypes {
    fn default() -> Self {
        let mut types = Self::all();
        types.remove(Self::CONNECTION_APPROVAL);
        types.remove(Self::UNCONNECTED_DATA);
        types.remove(Self::VERBOSE_DEBUG);
        types.remove(Self::CONNECTION_LATENCY_UPDATED);
        types
    }
}

impl BitOr for MessageTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MessageTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MessageTypes, &str); 12] = [
            (MessageTypes::STATUS_CHANGED, "STATUS_CHANGED"),
            (MessageTypes::UNCONNECTED_DATA, "UNCONNECTED_DATA"),
            (MessageTypes::CONNECTION_APPROVAL, "CONNECTION_APPROVAL"),
            (MessageTypes::DATA, "DATA"),
            (MessageTypes::RECEIPT, "RECEIPT"),
            (MessageTypes::DISCOVERY_REQUEST, "DISCOVERY_REQUEST"),
            (MessageTypes::DISCOVERY_RESPONSE, "DISCOVERY_RESPONSE"),
            (MessageTypes::VERBOSE_DEBUG, "VERBOSE_DEBUG"),
            (MessageTypes::DEBUG, "DEBUG"),
            (MessageTypes::WARNING, "WARNING"),
            (MessageTypes::ERROR, "ERROR"),
            (MessageTypes::CONNECTION_LATENCY_UPDATED, "CONNECTION_LATENCY_UPDATED"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}
