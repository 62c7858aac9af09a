use std::{net::SocketAddr, ops::Deref};

use sluice_connection::{Connection, SendResult};
use sluice_core::{
    config::Config,
    error::{ErrorKind, Result},
};
use sluice_protocol::{delivery::DeliveryMethod, outgoing::OutgoingMessage, status::ConnectionStatus};

use crate::peer::Peer;

/// A peer with at most one connection, to a server.
///
/// Dereferences to [`Peer`] for everything else.
#[derive(Debug)]
pub struct Client {
    peer: Peer,
}

impl Client {
    /// Creates a stopped client; `accept_incoming_connections` is forced off.
    pub fn new(config: Config) -> Result<Self> {
        let config = config.to_builder().accept_incoming_connections(false).build()?;
        Ok(Self { peer: Peer::new(config) })
    }

    /// Connects to `server`.
    ///
    /// Fails with `AlreadyConnected` while a connection is established or a handshake
    /// with another endpoint is pending. Connecting again to the endpoint being
    /// handshaked with returns that connection and resends the handshake.
    pub fn connect(&self, server: SocketAddr, hail: Option<OutgoingMessage>) -> Result<Connection> {
        if let Some(existing) = self.server_connection() {
            return Err(ErrorKind::AlreadyConnected(existing.remote_address()));
        }
        if let Some(pending) = self.peer.pending_handshakes().into_iter().find(|c| c.remote_address() != server) {
            return Err(ErrorKind::AlreadyConnected(pending.remote_address()));
        }
        self.peer.connect(server, hail)
    }

    /// The established server connection, if any.
    pub fn server_connection(&self) -> Option<Connection> {
        self.peer.connections().into_iter().next()
    }

    /// Status of the server connection, `Disconnected` when there is none.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.current().map_or(ConnectionStatus::Disconnected, |connection| connection.status())
    }

    /// Closes the server connection or aborts the pending handshake.
    pub fn disconnect(&self, reason: &str) {
        for connection in self.peer.connections().into_iter().chain(self.peer.pending_handshakes()) {
            connection.disconnect(reason);
        }
    }

    /// Sends `message` to the server.
    pub fn send_message(&self, message: OutgoingMessage, method: DeliveryMethod, channel: u8) -> SendResult {
        match self.server_connection() {
            Some(connection) => connection.send_message(message, method, channel),
            None => {
                self.peer.discard(message);
                SendResult::NotConnected
            }
        }
    }

    fn current(&self) -> Option<Connection> {
        self.server_connection().or_else(|| self.peer.pending_handshakes().into_iter().next())
    }
}

impl Deref for Client {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        net::{IpAddr, Ipv4Addr, UdpSocket},
        time::Duration,
    };

    use sluice_protocol::{
        delivery::{LibraryMessage, MessageType},
        header::read_message,
    };

    use super::*;

    fn client() -> Client {
        let config = Config::builder("client-test")
            .local_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .accept_incoming_connections(true)
            .build()
            .unwrap();
        Client::new(config).unwrap()
    }

    #[test]
    fn test_client_refuses_incoming() {
        assert!(!client().configuration().accept_incoming_connections());
    }

    #[test]
    fn test_disconnected_without_server() {
        let client = client();
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert!(client.server_connection().is_none());
        let result = client.send_message(OutgoingMessage::from_bytes(&[1]), DeliveryMethod::Unreliable, 0);
        assert_eq!(result, SendResult::NotConnected);
    }

    /// Counts Connect messages arriving on `socket` until it stays quiet for `quiet`.
    fn connect_messages(socket: &UdpSocket, quiet: Duration) -> usize {
        socket.set_read_timeout(Some(quiet)).unwrap();
        let mut buffer = [0u8; 2048];
        let mut count = 0;
        while let Ok((length, _)) = socket.recv_from(&mut buffer) {
            let mut cursor = Cursor::new(&buffer[..length]);
            while let Ok((header, _)) = read_message(&mut cursor) {
                if header.message_type == MessageType::Library(LibraryMessage::Connect) {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn test_reconnect_while_handshaking_resends_once() {
        let config = Config::builder("client-test")
            .local_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .resend_handshake_interval(Duration::from_secs(20))
            .connection_timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        let client = Client::new(config).unwrap();
        client.start().unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = server.local_addr().unwrap();

        let first = client.connect(address, None).unwrap();
        assert_eq!(connect_messages(&server, Duration::from_millis(500)), 1);

        let again = client.connect(address, None).unwrap();
        assert_eq!(again.remote_address(), first.remote_address());
        assert_eq!(connect_messages(&server, Duration::from_millis(500)), 1);

        assert!(matches!(
            client.connect("127.0.0.1:10".parse().unwrap(), None),
            Err(ErrorKind::AlreadyConnected(pending)) if pending == address
        ));
        client.shutdown("done");
    }
}
