use std::ops::Deref;

use sluice_connection::{Connection, SendResult};
use sluice_core::{config::Config, error::Result};
use sluice_protocol::{delivery::DeliveryMethod, outgoing::OutgoingMessage};

use crate::peer::Peer;

/// A peer that accepts incoming connections and broadcasts to them.
///
/// Dereferences to [`Peer`] for everything else.
#[derive(Debug)]
pub struct Server {
    peer: Peer,
}

impl Server {
    /// Creates a stopped server; `accept_incoming_connections` is forced on.
    pub fn new(config: Config) -> Result<Self> {
        let config = config.to_builder().accept_incoming_connections(true).build()?;
        Ok(Self { peer: Peer::new(config) })
    }

    /// Sends `message` to every established connection.
    pub fn send_to_all(&self, message: OutgoingMessage, method: DeliveryMethod, channel: u8) -> SendResult {
        let recipients = self.peer.connections();
        self.peer.send_to_many(message, &recipients, method, channel)
    }

    /// Sends `message` to every established connection except `except`.
    pub fn send_to_all_except(
        &self,
        message: OutgoingMessage,
        except: &Connection,
        method: DeliveryMethod,
        channel: u8,
    ) -> SendResult {
        let recipients: Vec<Connection> =
            self.peer.connections().into_iter().filter(|connection| connection != except).collect();
        self.peer.send_to_many(message, &recipients, method, channel)
    }
}

impl Deref for Server {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}
