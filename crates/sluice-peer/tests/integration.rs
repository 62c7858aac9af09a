use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use sluice_connection::{Connection, IncomingMessage, IncomingMessageKind, SendResult};
use sluice_core::{config::Config, error::ErrorKind, message_types::MessageTypes};
use sluice_peer::{Client, Peer, PeerStatus, Server, REASON_SERVER_FULL};
use sluice_protocol::{delivery::DeliveryMethod, outgoing::OutgoingMessage, status::ConnectionStatus};

const APP: &str = "sluice-integration";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("sluice=debug").with_test_writer().try_init();
}

fn config() -> Config {
    Config::builder(APP)
        .local_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .resend_handshake_interval(Duration::from_millis(200))
        .maximum_handshake_attempts(20)
        .build()
        .unwrap()
}

fn start_server(config: Config) -> (Server, SocketAddr) {
    let server = Server::new(config).unwrap();
    server.start().unwrap();
    let address = server.local_address().unwrap();
    (server, address)
}

fn start_client(config: Config) -> Client {
    let client = Client::new(config).unwrap();
    client.start().unwrap();
    client
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Reads messages until one satisfies `accept`, discarding the others.
fn wait_for(peer: &Peer, timeout: Duration, mut accept: impl FnMut(&IncomingMessage) -> bool) -> Option<IncomingMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        let message = peer.wait_message(left.min(Duration::from_millis(50)));
        if let Some(message) = message {
            if accept(&message) {
                return Some(message);
            }
            peer.recycle(message);
        }
    }
}

fn connected_pair(server_config: Config, client_config: Config) -> (Server, Client, Connection) {
    let (server, address) = start_server(server_config);
    let client = start_client(client_config);
    let connection = client.connect(address, None).unwrap();
    let ready = wait_until(Duration::from_secs(10), || {
        connection.status() == ConnectionStatus::Connected
            && client.connections_count() == 1
            && server.connections().first().is_some_and(|c| c.status() == ConnectionStatus::Connected)
    });
    assert!(ready, "handshake did not complete");
    (server, client, connection)
}

#[test]
fn test_client_connects_to_server() {
    init_tracing();
    let (server, address) = start_server(config());
    let client = start_client(config());
    let connection = client.connect(address, None).unwrap();

    let ready = wait_until(Duration::from_secs(3), || {
        server.connections_count() == 1 && connection.status() == ConnectionStatus::Connected
    });
    assert!(ready);
    let remote = &server.connections()[0];
    assert!(wait_until(Duration::from_secs(1), || remote.status() == ConnectionStatus::Connected));
    assert_eq!(remote.remote_unique_identifier(), client.unique_identifier());
    assert_eq!(connection.remote_unique_identifier(), server.unique_identifier());
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);

    let status = wait_for(&client, Duration::from_secs(1), |m| {
        matches!(m.kind(), IncomingMessageKind::StatusChanged { status: ConnectionStatus::Connected, .. })
    });
    assert!(status.is_some());
    assert_eq!(connection.visible_status(), ConnectionStatus::Connected);
}

#[test]
fn test_large_reliable_message_survives_loss() {
    init_tracing();
    let lossy = config().to_builder().simulated_loss(0.1).build().unwrap();
    let (server, client, _) = connected_pair(lossy.clone(), lossy);

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let result = server.send_to_all(OutgoingMessage::from_bytes(&payload), DeliveryMethod::ReliableOrdered, 0);
    assert_eq!(result, SendResult::Sent);

    let data = wait_for(&client, Duration::from_secs(20), |m| m.kind() == &IncomingMessageKind::Data)
        .expect("message was not delivered");
    assert_eq!(data.data(), &payload[..]);
    assert_eq!(data.delivery_method(), Some(DeliveryMethod::ReliableOrdered));

    let duplicate = wait_for(&client, Duration::from_millis(500), |m| m.kind() == &IncomingMessageKind::Data);
    assert!(duplicate.is_none());
}

#[test]
fn test_full_window_reports_queue_full() {
    init_tracing();
    let slow = config().to_builder().simulated_minimum_latency(Duration::from_millis(300)).build().unwrap();
    let (_server, client, connection) = connected_pair(config(), slow);

    for i in 0..64u8 {
        let result = client.send_message(OutgoingMessage::from_bytes(&[i]), DeliveryMethod::ReliableOrdered, 0);
        assert_eq!(result, SendResult::Sent);
    }
    let result = client.send_message(OutgoingMessage::from_bytes(&[64]), DeliveryMethod::ReliableOrdered, 0);
    assert_eq!(result, SendResult::QueueFull);
    assert!(!connection.can_send(DeliveryMethod::ReliableOrdered, 0));

    assert!(wait_until(Duration::from_secs(5), || connection.can_send(DeliveryMethod::ReliableOrdered, 0)));
    let result = client.send_message(OutgoingMessage::from_bytes(&[65]), DeliveryMethod::ReliableOrdered, 0);
    assert_eq!(result, SendResult::Sent);
}

#[test]
fn test_messages_arrive_in_order() {
    init_tracing();
    let (server, client, _) = connected_pair(config(), config());
    for i in 0..40u32 {
        let mut message = client.create_message();
        message.write_u32(i);
        assert_eq!(client.send_message(message, DeliveryMethod::ReliableOrdered, 3), SendResult::Sent);
    }

    let mut received = Vec::new();
    while received.len() < 40 {
        let mut message = wait_for(&server, Duration::from_secs(5), |m| m.kind() == &IncomingMessageKind::Data)
            .expect("missing message");
        assert_eq!(message.channel(), Some(3));
        received.push(message.read_u32().unwrap());
        server.recycle(message);
    }
    assert_eq!(received, (0..40).collect::<Vec<_>>());
}

#[test]
fn test_receipt_after_acknowledgment() {
    init_tracing();
    let (_server, client, _) = connected_pair(config(), config());
    let mut message = OutgoingMessage::from_bytes(b"tracked");
    message.set_receipt(77);
    assert_eq!(client.send_message(message, DeliveryMethod::ReliableUnordered, 0), SendResult::Sent);

    let receipt = wait_for(&client, Duration::from_secs(5), |m| matches!(m.kind(), IncomingMessageKind::Receipt(_)));
    assert_eq!(receipt.map(|m| m.kind().clone()), Some(IncomingMessageKind::Receipt(77)));
}

#[test]
fn test_discovery_round_trip() {
    init_tracing();
    let (server, address) = start_server(config());
    let client = start_client(config());
    client.discover_known_peer(address).unwrap();

    let request = wait_for(&server, Duration::from_secs(3), |m| m.kind() == &IncomingMessageKind::DiscoveryRequest)
        .expect("no discovery request");
    let requester = request.sender().unwrap();
    assert_eq!(requester, client.local_address().unwrap());

    let mut answer = server.create_message();
    answer.write_string("lobby 1");
    assert_eq!(server.send_discovery_response(answer, requester), SendResult::Sent);

    let mut response = wait_for(&client, Duration::from_secs(3), |m| m.kind() == &IncomingMessageKind::DiscoveryResponse)
        .expect("no discovery response");
    assert_eq!(response.sender(), Some(address));
    assert_eq!(response.read_string().unwrap(), "lobby 1");
}

#[test]
fn test_unconnected_message() {
    init_tracing();
    let receiving = config().to_builder().enable_message_type(MessageTypes::UNCONNECTED_DATA).build().unwrap();
    let (server, address) = start_server(receiving);
    let client = start_client(config());

    assert_eq!(client.send_unconnected_message(OutgoingMessage::from_bytes(b"hello"), address), SendResult::Sent);
    let message = wait_for(&server, Duration::from_secs(3), |m| m.kind() == &IncomingMessageKind::UnconnectedData)
        .expect("no unconnected data");
    assert_eq!(message.data(), b"hello");
    assert_eq!(message.sender(), client.local_address());
    assert_eq!(server.connections_count(), 0);
}

#[test]
fn test_connection_approval_with_hail() {
    init_tracing();
    let approving = config().to_builder().enable_message_type(MessageTypes::CONNECTION_APPROVAL).build().unwrap();
    let (server, address) = start_server(approving);
    let client = start_client(config());
    let connection = client.connect(address, Some(OutgoingMessage::from_bytes(b"let me in"))).unwrap();

    let approval = wait_for(&server, Duration::from_secs(3), |m| m.kind() == &IncomingMessageKind::ConnectionApproval)
        .expect("no approval request");
    assert_eq!(approval.data(), b"let me in");
    approval.connection().unwrap().approve_with_hail(OutgoingMessage::from_bytes(b"welcome"));

    assert!(wait_until(Duration::from_secs(3), || connection.status() == ConnectionStatus::Connected));
    assert_eq!(connection.remote_hail(), Some(b"welcome".to_vec()));
}

#[test]
fn test_denied_connection() {
    init_tracing();
    let approving = config().to_builder().enable_message_type(MessageTypes::CONNECTION_APPROVAL).build().unwrap();
    let (server, address) = start_server(approving);
    let client = start_client(config());
    let connection = client.connect(address, None).unwrap();

    let approval = wait_for(&server, Duration::from_secs(3), |m| m.kind() == &IncomingMessageKind::ConnectionApproval)
        .expect("no approval request");
    approval.connection().unwrap().deny("go away");

    let closed = wait_for(&client, Duration::from_secs(3), |m| {
        matches!(m.kind(), IncomingMessageKind::StatusChanged { status: ConnectionStatus::Disconnected, .. })
    })
    .expect("no disconnect");
    assert_eq!(
        closed.kind(),
        &IncomingMessageKind::StatusChanged { status: ConnectionStatus::Disconnected, reason: "go away".into() }
    );
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert!(wait_until(Duration::from_secs(1), || client.get_connection(address).is_none()));
}

#[test]
fn test_full_server_rejects() {
    init_tracing();
    let single = config().to_builder().maximum_connections(1).build().unwrap();
    let (server, _first, _) = connected_pair(single, config());
    let address = server.local_address().unwrap();

    let second = start_client(config());
    second.connect(address, None).unwrap();
    let closed = wait_for(&second, Duration::from_secs(3), |m| {
        matches!(m.kind(), IncomingMessageKind::StatusChanged { status: ConnectionStatus::Disconnected, .. })
    })
    .expect("second client was not rejected");
    assert_eq!(
        closed.kind(),
        &IncomingMessageKind::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason: REASON_SERVER_FULL.into()
        }
    );
    assert_eq!(server.connections_count(), 1);
}

#[test]
fn test_shutdown_disconnects_remote() {
    init_tracing();
    let (server, client, _) = connected_pair(config(), config());
    client.shutdown("leaving");
    assert_eq!(client.status(), PeerStatus::NotRunning);
    assert!(client.connections().is_empty());

    let closed = wait_for(&server, Duration::from_secs(3), |m| {
        matches!(m.kind(), IncomingMessageKind::StatusChanged { status: ConnectionStatus::Disconnected, .. })
    })
    .expect("server did not see the disconnect");
    assert_eq!(
        closed.kind(),
        &IncomingMessageKind::StatusChanged { status: ConnectionStatus::Disconnected, reason: "leaving".into() }
    );
    assert!(wait_until(Duration::from_secs(1), || server.connections_count() == 0));
    assert!(matches!(client.connect(server.local_address().unwrap(), None), Err(ErrorKind::NotRunning)));
}

#[test]
fn test_statistics_count_traffic() {
    init_tracing();
    let (server, client, connection) = connected_pair(config(), config());
    for _ in 0..5 {
        let result = client.send_message(OutgoingMessage::from_bytes(&[0u8; 100]), DeliveryMethod::ReliableUnordered, 0);
        assert_eq!(result, SendResult::Sent);
    }
    assert!(wait_until(Duration::from_secs(5), || server.statistics().messages_received >= 5));

    let client_stats = client.statistics();
    assert!(client_stats.packets_sent > 0);
    assert!(client_stats.bytes_sent > 500);
    assert_eq!(client_stats.active_connections, 1);
    assert!(wait_until(Duration::from_secs(2), || connection.statistics().messages_sent >= 5));
}

#[test]
fn test_manual_flush() {
    init_tracing();
    let manual = config().to_builder().auto_flush_send_queue(false).build().unwrap();
    let (server, client, _) = connected_pair(config(), manual);
    let result = client.send_message(OutgoingMessage::from_bytes(b"held"), DeliveryMethod::ReliableOrdered, 0);
    assert_eq!(result, SendResult::Sent);

    let early = wait_for(&server, Duration::from_millis(300), |m| m.kind() == &IncomingMessageKind::Data);
    assert!(early.is_none());

    client.flush_send_queue();
    let message = wait_for(&server, Duration::from_secs(3), |m| m.kind() == &IncomingMessageKind::Data)
        .expect("flushed message did not arrive");
    assert_eq!(message.data(), b"held");
}
