#![warn(missing_docs)]

//! sluice: reliable UDP peer-to-peer messaging.
//!
//! This crate re-exports the pieces most applications need:
//!
//! - Peers and their wrappers (`Peer`, `Server`, `Client`)
//! - Configuration (`Config`, `MessageTypes`, `UnreliableSizeBehaviour`)
//! - Messages (`OutgoingMessage`, `IncomingMessage`, `IncomingMessageKind`)
//! - Delivery (`DeliveryMethod`, `SendResult`, `Connection`, `ConnectionStatus`)
//!
//! Example
//! ```no_run
//! use std::time::Duration;
//! use sluice::prelude::*;
//!
//! let config = Config::builder("my game").port(14242).build()?;
//! let server = Server::new(config)?;
//! server.start()?;
//!
//! while let Some(mut message) = server.wait_message(Duration::from_secs(1)) {
//!     if let IncomingMessageKind::Data = message.kind() {
//!         let text = message.read_string()?;
//!         let mut reply = server.create_message();
//!         reply.write_string(&text);
//!         if let Some(sender) = message.connection() {
//!             sender.send_message(reply, DeliveryMethod::ReliableOrdered, 0);
//!         }
//!     }
//!     server.recycle(message);
//! }
//! # Ok::<(), sluice::ErrorKind>(())
//! ```

// Core: configuration, errors, the bit buffer and its schema traits
pub use sluice_core::{
    bit_buffer::{BitBuffer, Decode, Encode},
    config::{Config, ConfigBuilder, UnreliableSizeBehaviour},
    error::{ErrorKind, Result},
    message_types::MessageTypes,
};
// Protocol: delivery methods, statuses and outgoing messages
pub use sluice_protocol::{ConnectionStatus, DeliveryMethod, OutgoingMessage};
// Connections and released messages
pub use sluice_connection::{Connection, ConnectionStatistics, IncomingMessage, IncomingMessageKind, SendResult};
// Peers
pub use sluice_peer::{Client, Clock, Peer, PeerStatistics, PeerStatus, Server, SystemClock};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Client, Config, Connection, ConnectionStatus, DeliveryMethod, IncomingMessage, IncomingMessageKind,
        MessageTypes, OutgoingMessage, Peer, SendResult, Server,
    };
}
