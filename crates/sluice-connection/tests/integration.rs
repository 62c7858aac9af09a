//! Integration tests for the sluice-connection crate.
//!
//! Two `ConnectionState`s are wired back to back without sockets: datagrams one
//! side produces are parsed and fed to the other, optionally reordered or dropped.

use std::{
    io::Cursor,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use sluice_connection::{
    state::{REASON_HANDSHAKE_FAILED, REASON_TIMED_OUT, REASON_WRONG_APP_IDENTIFIER},
    Action, Connection, ConnectionState, IncomingMessage, IncomingMessageKind, PeerContext, SendResult,
};
use sluice_core::{config::Config, message_types::MessageTypes};
use sluice_protocol::{
    delivery::{DeliveryMethod, LibraryMessage, MessageType},
    header::{read_message, MessageHeader},
    library::{decode_payload, HandshakePayload},
    outgoing::OutgoingMessage,
    status::ConnectionStatus,
};

struct Side {
    context: Arc<PeerContext>,
    state: ConnectionState,
    outbox: Vec<Vec<u8>>,
    inbox: Vec<IncomingMessage>,
}

impl Side {
    fn collect(&mut self) {
        for action in self.state.drain_actions() {
            match action {
                Action::Send(datagram) => self.outbox.push(datagram),
                Action::Emit(message) => self.inbox.push(message),
            }
        }
    }

    fn update(&mut self, time: Instant) {
        self.state.update(time, true);
        self.collect();
    }

    fn deliver(&mut self, datagram: &[u8], time: Instant) {
        self.state.on_datagram(datagram.len(), time);
        for (header, payload) in parse(datagram) {
            self.state.process_message(&header, &payload, time);
        }
        self.collect();
    }

    fn deliver_messages(&mut self, messages: &[(MessageHeader, Vec<u8>)], time: Instant) {
        for (header, payload) in messages {
            self.state.process_message(header, payload, time);
        }
        self.collect();
    }

    fn connection(&self) -> &Connection {
        self.state.handle()
    }

    fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    fn take_data(&mut self) -> Vec<Vec<u8>> {
        let (data, rest): (Vec<_>, Vec<_>) =
            self.inbox.drain(..).partition(|message| *message.kind() == IncomingMessageKind::Data);
        self.inbox = rest;
        data.iter().map(|message| message.data().to_vec()).collect()
    }

    fn statuses(&self) -> Vec<(ConnectionStatus, String)> {
        self.inbox
            .iter()
            .filter_map(|message| match message.kind() {
                IncomingMessageKind::StatusChanged { status, reason } => Some((*status, reason.clone())),
                _ => None,
            })
            .collect()
    }

    fn last_status(&self) -> Option<(ConnectionStatus, String)> {
        self.statuses().pop()
    }
}

fn parse(datagram: &[u8]) -> Vec<(MessageHeader, Vec<u8>)> {
    let mut cursor = Cursor::new(datagram);
    let mut messages = Vec::new();
    while (cursor.position() as usize) < datagram.len() {
        let (header, payload) = read_message(&mut cursor).unwrap();
        messages.push((header, payload.to_vec()));
    }
    messages
}

fn user_messages(datagrams: &[Vec<u8>]) -> Vec<(MessageHeader, Vec<u8>)> {
    datagrams
        .iter()
        .flat_map(|datagram| parse(datagram))
        .filter(|(header, _)| matches!(header.message_type, MessageType::User { .. }))
        .collect()
}

fn config(app: &str) -> Config {
    Config::builder(app).build().unwrap()
}

fn client_addr() -> SocketAddr {
    "127.0.0.1:5000".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "127.0.0.1:6000".parse().unwrap()
}

fn start_client(config: Config, hail: &[u8], time: Instant) -> Side {
    let context = PeerContext::new(config);
    let handle = Connection::new(server_addr(), context.clone());
    let state = ConnectionState::outbound(handle, context.clone(), hail.to_vec(), time);
    let mut side = Side { context, state, outbox: Vec::new(), inbox: Vec::new() };
    side.collect();
    side
}

/// Builds the responder side from the Connect message in `datagram`.
fn accept(config: Config, datagram: &[u8], time: Instant) -> Side {
    let (header, payload) = parse(datagram).remove(0);
    assert_eq!(header.message_type, MessageType::Library(LibraryMessage::Connect));
    let request: HandshakePayload = decode_payload(&payload).unwrap();
    let context = PeerContext::new(config);
    let handle = Connection::new(client_addr(), context.clone());
    let mut state = ConnectionState::inbound(handle, context.clone(), request, time);
    state.on_datagram(datagram.len(), time);
    let mut side = Side { context, state, outbox: Vec::new(), inbox: Vec::new() };
    side.collect();
    side
}

/// Moves datagrams both ways until neither side has anything left to send.
fn exchange(client: &mut Side, server: &mut Side, time: Instant) {
    for _ in 0..16 {
        client.update(time);
        server.update(time);
        let to_server = client.take_outbox();
        let to_client = server.take_outbox();
        if to_server.is_empty() && to_client.is_empty() {
            return;
        }
        for datagram in &to_server {
            server.deliver(datagram, time);
        }
        for datagram in &to_client {
            client.deliver(datagram, time);
        }
    }
    panic!("traffic did not settle");
}

fn connected_pair(time: Instant) -> (Side, Side) {
    let mut client = start_client(config("integration"), b"hello", time);
    client.update(time);
    let connect = client.take_outbox().remove(0);
    let mut server = accept(config("integration"), &connect, time);
    exchange(&mut client, &mut server, time);
    assert_eq!(client.state.status(), ConnectionStatus::Connected);
    assert_eq!(server.state.status(), ConnectionStatus::Connected);
    client.inbox.clear();
    server.inbox.clear();
    (client, server)
}

fn send_bytes(side: &Side, bytes: &[u8], method: DeliveryMethod, channel: u8) -> SendResult {
    side.connection().send_message(OutgoingMessage::from_bytes(bytes), method, channel)
}

#[test]
fn test_handshake_connects_both_sides() {
    let time = Instant::now();
    let mut client = start_client(config("integration"), b"hello", time);
    assert_eq!(client.state.status(), ConnectionStatus::InitiatedConnect);

    client.update(time);
    let outbox = client.take_outbox();
    assert_eq!(outbox.len(), 1);

    let mut server = accept(config("integration"), &outbox[0], time);
    assert_eq!(server.state.status(), ConnectionStatus::RespondedConnect);
    assert_eq!(server.connection().remote_hail(), Some(b"hello".to_vec()));
    assert_eq!(server.connection().remote_unique_identifier(), client.context.unique_identifier());

    exchange(&mut client, &mut server, time);
    assert_eq!(client.state.status(), ConnectionStatus::Connected);
    assert_eq!(server.state.status(), ConnectionStatus::Connected);
    assert_eq!(client.connection().status(), ConnectionStatus::Connected);
    assert_eq!(client.connection().remote_unique_identifier(), server.context.unique_identifier());

    let client_statuses: Vec<_> = client.statuses().into_iter().map(|(status, _)| status).collect();
    assert_eq!(client_statuses, vec![ConnectionStatus::InitiatedConnect, ConnectionStatus::Connected]);
    let server_statuses: Vec<_> = server.statuses().into_iter().map(|(status, _)| status).collect();
    assert_eq!(
        server_statuses,
        vec![ConnectionStatus::ReceivedInitiation, ConnectionStatus::RespondedConnect, ConnectionStatus::Connected]
    );
}

#[test]
fn test_duplicate_connect_resends_response_once() {
    let time = Instant::now();
    let mut client = start_client(config("integration"), b"", time);
    client.update(time);
    let connect = client.take_outbox().remove(0);
    let mut server = accept(config("integration"), &connect, time);
    assert_eq!(server.take_outbox().len(), 1);

    server.deliver(&connect, time);
    let resent = server.take_outbox();
    assert!(resent.is_empty(), "answers are written on the next update");

    server.update(time);
    let resent = server.take_outbox();
    assert_eq!(resent.len(), 1);
    let messages = parse(&resent[0]);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0.message_type, MessageType::Library(LibraryMessage::ConnectResponse));
    assert_eq!(server.state.status(), ConnectionStatus::RespondedConnect);
}

#[test]
fn test_handshake_gives_up_after_max_attempts() {
    let time = Instant::now();
    let config = Config::builder("integration")
        .maximum_handshake_attempts(3)
        .resend_handshake_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut client = start_client(config, b"", time);

    let mut sent = 0;
    for second in 0..3 {
        client.update(time + Duration::from_secs(second));
        sent += client.take_outbox().len();
        assert_eq!(client.state.status(), ConnectionStatus::InitiatedConnect);
    }
    assert_eq!(sent, 3);

    client.update(time + Duration::from_secs(3));
    assert!(client.take_outbox().is_empty());
    assert_eq!(client.state.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        client.last_status(),
        Some((ConnectionStatus::Disconnected, REASON_HANDSHAKE_FAILED.to_string()))
    );
}

#[test]
fn test_requested_handshake_resend_goes_out_immediately() {
    let time = Instant::now();
    let mut client = start_client(config("integration"), b"", time);
    client.update(time);
    assert_eq!(client.take_outbox().len(), 1);

    client.update(time + Duration::from_millis(10));
    assert!(client.take_outbox().is_empty());

    client.connection().request_handshake_resend();
    client.update(time + Duration::from_millis(20));
    let resent = client.take_outbox();
    assert_eq!(resent.len(), 1);
    assert_eq!(parse(&resent[0])[0].0.message_type, MessageType::Library(LibraryMessage::Connect));
}

#[test]
fn test_wrong_app_identifier_disconnects_initiator() {
    let time = Instant::now();
    let mut client = start_client(config("alpha"), b"", time);
    client.update(time);
    let connect = client.take_outbox().remove(0);
    let mut server = accept(config("beta"), &connect, time);

    for datagram in server.take_outbox() {
        client.deliver(&datagram, time);
    }
    assert_eq!(client.state.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        client.last_status(),
        Some((ConnectionStatus::Disconnected, REASON_WRONG_APP_IDENTIFIER.to_string()))
    );
    let notice = client.take_outbox();
    assert_eq!(notice.len(), 1);
    assert_eq!(parse(&notice[0])[0].0.message_type, MessageType::Library(LibraryMessage::Disconnect));
}

#[test]
fn test_approval_then_connect() {
    let time = Instant::now();
    let server_config =
        Config::builder("integration").enable_message_type(MessageTypes::CONNECTION_APPROVAL).build().unwrap();
    let mut client = start_client(config("integration"), b"let me in", time);
    client.update(time);
    let connect = client.take_outbox().remove(0);
    let mut server = accept(server_config, &connect, time);

    assert_eq!(server.state.status(), ConnectionStatus::RespondedAwaitingApproval);
    assert!(server.take_outbox().is_empty());
    let approval = server
        .inbox
        .iter()
        .find(|message| *message.kind() == IncomingMessageKind::ConnectionApproval)
        .expect("approval request released");
    assert_eq!(approval.data(), b"let me in");

    server.connection().approve();
    exchange(&mut client, &mut server, time);
    assert_eq!(client.state.status(), ConnectionStatus::Connected);
    assert_eq!(server.state.status(), ConnectionStatus::Connected);
}

#[test]
fn test_denied_connection_reports_reason() {
    let time = Instant::now();
    let server_config =
        Config::builder("integration").enable_message_type(MessageTypes::CONNECTION_APPROVAL).build().unwrap();
    let mut client = start_client(config("integration"), b"", time);
    client.update(time);
    let connect = client.take_outbox().remove(0);
    let mut server = accept(server_config, &connect, time);

    server.connection().deny("Server is closed");
    server.update(time);
    assert_eq!(server.state.status(), ConnectionStatus::Disconnected);

    for datagram in server.take_outbox() {
        client.deliver(&datagram, time);
    }
    assert_eq!(client.last_status(), Some((ConnectionStatus::Disconnected, "Server is closed".to_string())));
}

#[test]
fn test_disconnect_reaches_remote() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);

    client.connection().disconnect("bye");
    client.update(time);
    let statuses: Vec<_> = client.statuses().into_iter().map(|(status, _)| status).collect();
    assert_eq!(statuses, vec![ConnectionStatus::Disconnecting, ConnectionStatus::Disconnected]);

    for datagram in client.take_outbox() {
        server.deliver(&datagram, time);
    }
    assert_eq!(server.state.status(), ConnectionStatus::Disconnected);
    assert_eq!(server.last_status(), Some((ConnectionStatus::Disconnected, "bye".to_string())));
    assert_eq!(send_bytes(&server, b"late", DeliveryMethod::ReliableOrdered, 0), SendResult::NotConnected);
}

#[test]
fn test_silent_connection_times_out() {
    let time = Instant::now();
    let (mut client, _server) = connected_pair(time);

    client.update(time + Duration::from_secs(20));
    assert_eq!(client.state.status(), ConnectionStatus::Connected);

    client.update(time + Duration::from_secs(26));
    assert_eq!(client.state.status(), ConnectionStatus::Disconnected);
    assert_eq!(client.last_status(), Some((ConnectionStatus::Disconnected, REASON_TIMED_OUT.to_string())));
}

#[test]
fn test_reliable_ordered_survives_reordering() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);

    for i in 0..10u8 {
        assert_eq!(send_bytes(&client, &[i], DeliveryMethod::ReliableOrdered, 3), SendResult::Sent);
    }
    client.update(time);
    let mut messages = user_messages(&client.take_outbox());
    assert_eq!(messages.len(), 10);
    messages.reverse();

    server.deliver_messages(&messages[..9], time);
    assert!(server.take_data().is_empty());

    server.deliver_messages(&messages[9..], time);
    let data = server.take_data();
    assert_eq!(data, (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
}

#[test]
fn test_reliable_ordered_recovers_lost_message() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);

    for i in 0..3u8 {
        send_bytes(&client, &[i], DeliveryMethod::ReliableOrdered, 0);
    }
    client.update(time);
    let messages = user_messages(&client.take_outbox());
    server.deliver_messages(&[messages[0].clone(), messages[2].clone()], time);
    assert_eq!(server.take_data(), vec![vec![0]]);

    // The missing message is resent once the resend delay expires.
    let later = time + Duration::from_millis(500);
    server.update(later);
    for datagram in server.take_outbox() {
        client.deliver(&datagram, later);
    }
    client.update(later);
    let resent = user_messages(&client.take_outbox());
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].0.sequence, messages[1].0.sequence);

    server.deliver_messages(&resent, later);
    assert_eq!(server.take_data(), vec![vec![1], vec![2]]);
    assert_eq!(client.state.statistics().messages_resent, 1);
}

#[test]
fn test_sequenced_drops_late_messages() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);

    for i in 0..5u8 {
        send_bytes(&client, &[i], DeliveryMethod::UnreliableSequenced, 1);
    }
    client.update(time);
    let messages = user_messages(&client.take_outbox());
    let shuffled: Vec<_> = [0, 2, 1, 4, 3].iter().map(|&i| messages[i].clone()).collect();

    server.deliver_messages(&shuffled, time);
    assert_eq!(server.take_data(), vec![vec![0], vec![2], vec![4]]);
    assert_eq!(server.state.statistics().messages_dropped, 2);
}

#[test]
fn test_fragments_reassemble_in_any_order() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

    assert_eq!(send_bytes(&client, &payload, DeliveryMethod::ReliableUnordered, 0), SendResult::Sent);
    client.update(time);
    let mut fragments = user_messages(&client.take_outbox());
    assert_eq!(fragments.len(), 4);
    assert!(fragments.iter().all(|(header, _)| header.is_fragment));
    fragments.swap(0, 3);
    fragments.swap(1, 2);

    server.deliver_messages(&fragments[..3], time);
    assert!(server.take_data().is_empty());
    server.deliver_messages(&fragments[3..], time);

    let message = server.inbox.iter().find(|message| *message.kind() == IncomingMessageKind::Data).unwrap();
    assert!(message.is_fragment());
    assert_eq!(message.delivery_method(), Some(DeliveryMethod::ReliableUnordered));
    assert_eq!(server.take_data(), vec![payload]);
}

#[test]
fn test_full_window_rejects_until_acknowledged() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);
    let window = DeliveryMethod::ReliableOrdered.window_size();

    for i in 0..window {
        assert_eq!(send_bytes(&client, &[i as u8], DeliveryMethod::ReliableOrdered, 0), SendResult::Sent);
    }
    assert!(!client.connection().can_send(DeliveryMethod::ReliableOrdered, 0));
    assert_eq!(send_bytes(&client, b"x", DeliveryMethod::ReliableOrdered, 0), SendResult::QueueFull);
    assert!(client.connection().can_send(DeliveryMethod::ReliableOrdered, 1));

    exchange(&mut client, &mut server, time);
    assert_eq!(server.take_data().len(), window);
    assert!(client.connection().can_send(DeliveryMethod::ReliableOrdered, 0));
    assert!(client.state.is_idle());
}

#[test]
fn test_receipt_after_acknowledgment() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);

    let mut message = OutgoingMessage::from_bytes(b"tracked");
    message.set_receipt(42);
    assert_eq!(
        client.connection().send_message(message, DeliveryMethod::ReliableUnordered, 0),
        SendResult::Sent
    );

    client.update(time);
    assert!(client.inbox.iter().all(|message| *message.kind() != IncomingMessageKind::Receipt(42)));
    for datagram in client.take_outbox() {
        server.deliver(&datagram, time);
    }
    exchange(&mut client, &mut server, time);

    let receipts: Vec<_> =
        client.inbox.iter().filter(|message| *message.kind() == IncomingMessageKind::Receipt(42)).collect();
    assert_eq!(receipts.len(), 1);
}

#[test]
fn test_statistics_are_published_to_handle() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);

    send_bytes(&client, b"counted", DeliveryMethod::ReliableOrdered, 0);
    exchange(&mut client, &mut server, time);

    let published = client.connection().statistics();
    assert_eq!(published, *client.state.statistics());
    assert!(published.messages_sent >= 1);
    assert!(published.packets_sent >= 2);
    assert!(server.connection().statistics().messages_received >= 1);
}

#[test]
fn test_lost_unreliable_window_recovers() {
    let time = Instant::now();
    let (mut client, mut server) = connected_pair(time);
    let window = DeliveryMethod::Unreliable.window_size();

    for i in 0..window {
        assert_eq!(send_bytes(&client, &[i as u8], DeliveryMethod::Unreliable, 0), SendResult::Sent);
    }
    assert_eq!(send_bytes(&client, b"x", DeliveryMethod::Unreliable, 0), SendResult::QueueFull);

    client.update(time);
    let lost = client.take_outbox();
    assert_eq!(user_messages(&lost).len(), window);
    assert!(!client.connection().can_send(DeliveryMethod::Unreliable, 0));

    let later = time + Duration::from_secs(1);
    exchange(&mut client, &mut server, later);
    assert!(client.connection().can_send(DeliveryMethod::Unreliable, 0));
    assert!(client.state.is_idle());

    assert_eq!(send_bytes(&client, b"after", DeliveryMethod::Unreliable, 0), SendResult::Sent);
    exchange(&mut client, &mut server, later);
    assert_eq!(server.take_data(), vec![b"after".to_vec()]);
}
