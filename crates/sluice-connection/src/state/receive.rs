use std::time::Instant;

use sluice_core::bit_buffer::BitBuffer;
use sluice_protocol::{
    delivery::{DeliveryMethod, LibraryMessage, MessageType},
    fragment::FragmentHeader,
    header::MessageHeader,
    library::{decode_acknowledgements, decode_mtu_size, encode_mtu_success, Acknowledgement},
    status::ConnectionStatus,
};

use super::ConnectionState;
use crate::{
    channel::{Received, ReceiverChannel},
    fragment_group::FragmentOutcome,
    incoming::{IncomingMessage, IncomingMessageKind},
};

impl ConnectionState {
    /// Handles one message routed to this connection by the network loop.
    ///
    /// Unconnected and discovery messages are handled by the peer before routing
    /// and are ignored here.
    pub fn process_message(&mut self, header: &MessageHeader, payload: &[u8], time: Instant) {
        if self.is_disconnected() {
            return;
        }
        match header.message_type {
            MessageType::User { method, channel } => self.receive_user(header, method, channel, payload, time),
            MessageType::Library(message) => self.receive_library(message, payload, time),
            MessageType::Unconnected => {}
        }
    }

    fn receive_library(&mut self, message: LibraryMessage, payload: &[u8], time: Instant) {
        match message {
            LibraryMessage::Connect => self.on_connect(time),
            LibraryMessage::ConnectResponse => self.on_connect_response(payload, time),
            LibraryMessage::ConnectionEstablished => self.on_connection_established(time),
            LibraryMessage::Disconnect => self.on_disconnect(payload, time),
            LibraryMessage::Ping => {
                // The initiator only pings once it considers the connection established.
                if self.status == ConnectionStatus::RespondedConnect {
                    self.set_status(ConnectionStatus::Connected, "", time);
                }
                if self.status == ConnectionStatus::Connected {
                    let number = payload.first().copied().unwrap_or_default();
                    self.send_library(LibraryMessage::Pong, &[number]);
                }
            }
            LibraryMessage::Pong => {
                if let Some(&number) = payload.first() {
                    self.on_pong(number, time);
                }
            }
            LibraryMessage::Acknowledge => self.receive_acknowledgements(payload, time),
            LibraryMessage::ExpandMtuRequest => match decode_mtu_size(payload) {
                Ok(size) => self.send_library(LibraryMessage::ExpandMtuSuccess, &encode_mtu_success(size)),
                Err(error) => tracing::warn!("Malformed MTU probe from {}: {}", self.handle.remote_address(), error),
            },
            LibraryMessage::ExpandMtuSuccess => match decode_mtu_size(payload) {
                Ok(size) => self.on_mtu_success(size, time),
                Err(error) => tracing::warn!("Malformed MTU answer from {}: {}", self.handle.remote_address(), error),
            },
            LibraryMessage::Discovery | LibraryMessage::DiscoveryResponse => {}
        }
    }

    fn receive_acknowledgements(&mut self, payload: &[u8], time: Instant) {
        let acks = match decode_acknowledgements(payload) {
            Ok(acks) => acks,
            Err(error) => {
                tracing::warn!("Malformed acknowledgements from {}: {}", self.handle.remote_address(), error);
                return;
            }
        };

        let mut receipts = Vec::new();
        for Acknowledgement { message_type, sequence } in acks {
            let Some(index) = message_type.channel_index() else {
                continue;
            };
            let Some(sender) = self.senders[index].as_mut() else {
                continue;
            };
            let result = sender.receive_ack(sequence, self.context.pool());
            self.handle.release_backlog(index, result.freed);
            receipts.extend(result.receipts);
        }

        for tag in receipts {
            let message =
                IncomingMessage::new(IncomingMessageKind::Receipt(tag), time).with_connection(self.handle.clone());
            self.emit(message);
        }
    }

    fn receive_user(
        &mut self,
        header: &MessageHeader,
        method: DeliveryMethod,
        channel: u8,
        payload: &[u8],
        time: Instant,
    ) {
        // Data from the initiator means it got our response.
        if self.status == ConnectionStatus::RespondedConnect {
            self.set_status(ConnectionStatus::Connected, "", time);
        }
        if self.status != ConnectionStatus::Connected {
            tracing::trace!("Dropping {:?} from {} in status {}", header.message_type, self.handle.remote_address(), self.status);
            self.statistics.messages_dropped += 1;
            return;
        }
        let Some(index) = header.message_type.channel_index() else {
            return;
        };

        let acknowledged = match method {
            DeliveryMethod::Unreliable => !self.context.config().suppress_unreliable_unordered_acks(),
            _ => true,
        };
        if acknowledged {
            // Duplicates are acknowledged again; the first acknowledgment may have been lost.
            self.pending_acks.push(Acknowledgement { message_type: header.message_type, sequence: header.sequence });
        }

        let mut storage = self.context.pool().acquire(payload.len());
        storage.extend_from_slice(payload);
        let buffer = BitBuffer::from_parts(storage, header.payload_bits as usize);

        let receiver = self.receivers[index].get_or_insert_with(|| ReceiverChannel::new(method));
        match receiver.receive(header.sequence, (buffer, header.is_fragment)) {
            Received::Released(items) => {
                self.statistics.messages_received += 1;
                for (buffer, is_fragment) in items {
                    self.release_user(method, channel, buffer, is_fragment, time);
                }
            }
            Received::Withheld => self.statistics.messages_received += 1,
            Received::Dropped => {
                tracing::trace!(
                    "Dropping duplicate or late {:?} #{} from {}",
                    header.message_type,
                    header.sequence,
                    self.handle.remote_address()
                );
                self.statistics.messages_dropped += 1;
            }
        }
    }

    fn release_user(&mut self, method: DeliveryMethod, channel: u8, mut buffer: BitBuffer, is_fragment: bool, time: Instant) {
        let body = if is_fragment {
            let header = match FragmentHeader::decode(&mut buffer) {
                Ok(header) => header,
                Err(error) => {
                    self.log(
                        IncomingMessageKind::Warning(format!(
                            "Malformed fragment from {}: {}",
                            self.handle.remote_address(),
                            error
                        )),
                        time,
                    );
                    self.context.pool().release(buffer.into_bytes());
                    return;
                }
            };
            let outcome = self.fragments.insert(&header, &mut buffer, method.is_reliable(), self.context.pool(), time);
            self.context.pool().release(buffer.into_bytes());
            match outcome {
                FragmentOutcome::Complete(body) => body,
                FragmentOutcome::Pending | FragmentOutcome::Rejected => return,
            }
        } else {
            buffer
        };

        let message = IncomingMessage::new(IncomingMessageKind::Data, time)
            .with_body(body)
            .with_connection(self.handle.clone())
            .with_delivery(method, channel, is_fragment);
        self.emit(message);
    }
}
