use std::{sync::Arc, time::Instant};

use sluice_core::{bit_buffer::BitBuffer, message_types::MessageTypes};
use sluice_protocol::{
    delivery::LibraryMessage,
    library::{decode_payload, encode_payload, DisconnectPayload, HandshakePayload},
    status::ConnectionStatus,
};

use super::{ConnectionState, REASON_HANDSHAKE_FAILED, REASON_WRONG_APP_IDENTIFIER};
use crate::{
    context::PeerContext,
    handle::Connection,
    incoming::{IncomingMessage, IncomingMessageKind},
};

impl ConnectionState {
    /// Starts an outbound handshake; the first Connect goes out on the next `update`.
    pub fn outbound(handle: Connection, context: Arc<PeerContext>, hail: Vec<u8>, time: Instant) -> Self {
        let mut state = Self::new(handle, context, time);
        state.local_hail = hail;
        state.set_status(ConnectionStatus::InitiatedConnect, "", time);
        state
    }

    /// Accepts a validated Connect from a new endpoint.
    ///
    /// With connection approval enabled the connection waits in
    /// `RespondedAwaitingApproval` and a `ConnectionApproval` message carrying the
    /// remote hail is released; otherwise the response is sent right away.
    pub fn inbound(handle: Connection, context: Arc<PeerContext>, request: HandshakePayload, time: Instant) -> Self {
        let mut state = Self::new(handle, context, time);
        state.handle.set_remote_identity(request.unique_identifier, request.hail.clone());
        state.set_status(ConnectionStatus::ReceivedInitiation, "", time);

        if state.context.config().is_message_type_enabled(MessageTypes::CONNECTION_APPROVAL) {
            state.set_status(ConnectionStatus::RespondedAwaitingApproval, "", time);
            let message = IncomingMessage::new(IncomingMessageKind::ConnectionApproval, time)
                .with_body(BitBuffer::from_bytes(request.hail))
                .with_connection(state.handle.clone());
            state.emit(message);
        } else {
            state.respond(time);
        }
        state
    }

    pub(super) fn update_handshake(&mut self, time: Instant) {
        let message = match self.status {
            ConnectionStatus::InitiatedConnect => LibraryMessage::Connect,
            ConnectionStatus::RespondedConnect => LibraryMessage::ConnectResponse,
            _ => return,
        };
        let interval = self.context.config().resend_handshake_interval();
        let due = self.last_handshake_sent.map_or(true, |last| time.saturating_duration_since(last) >= interval);
        if !due {
            return;
        }
        if self.handshake_attempts >= self.context.config().maximum_handshake_attempts() {
            self.log(
                IncomingMessageKind::Debug(format!(
                    "No handshake answer from {} after {} attempts",
                    self.handle.remote_address(),
                    self.handshake_attempts
                )),
                time,
            );
            self.disconnect(REASON_HANDSHAKE_FAILED, false, time);
            return;
        }
        self.handshake_attempts += 1;
        self.last_handshake_sent = Some(time);
        self.send_handshake(message);
    }

    /// Repeats the current handshake message now, without counting an attempt.
    pub(super) fn resend_handshake(&mut self, time: Instant) {
        let message = match self.status {
            ConnectionStatus::InitiatedConnect => LibraryMessage::Connect,
            ConnectionStatus::RespondedConnect => LibraryMessage::ConnectResponse,
            _ => return,
        };
        tracing::trace!("Resending {:?} to {} on request", message, self.handle.remote_address());
        self.last_handshake_sent = Some(time);
        self.send_handshake(message);
    }

    pub(super) fn approve(&mut self, hail: Vec<u8>, time: Instant) {
        if self.status != ConnectionStatus::RespondedAwaitingApproval {
            tracing::warn!("Ignoring approval of {} in status {}", self.handle.remote_address(), self.status);
            return;
        }
        self.local_hail = hail;
        self.respond(time);
    }

    fn respond(&mut self, time: Instant) {
        self.handshake_attempts = 1;
        self.last_handshake_sent = Some(time);
        self.send_handshake(LibraryMessage::ConnectResponse);
        self.flush_datagram();
        self.set_status(ConnectionStatus::RespondedConnect, "", time);
    }

    fn send_handshake(&mut self, message: LibraryMessage) {
        let payload = HandshakePayload {
            app_identifier: self.context.config().app_identifier().to_owned(),
            unique_identifier: self.context.unique_identifier(),
            hail: self.local_hail.clone(),
        };
        let (bytes, _) = encode_payload(&payload);
        self.send_library(message, &bytes);
    }

    pub(super) fn on_connect(&mut self, time: Instant) {
        // The initiator did not get our response yet.
        if self.status == ConnectionStatus::RespondedConnect {
            self.resend_handshake(time);
        }
    }

    pub(super) fn on_connect_response(&mut self, payload: &[u8], time: Instant) {
        match self.status {
            ConnectionStatus::InitiatedConnect => {
                let response = match decode_payload::<HandshakePayload>(payload) {
                    Ok(response) => response,
                    Err(error) => {
                        self.log(
                            IncomingMessageKind::Warning(format!(
                                "Malformed ConnectResponse from {}: {}",
                                self.handle.remote_address(),
                                error
                            )),
                            time,
                        );
                        return;
                    }
                };
                if response.app_identifier != self.context.config().app_identifier() {
                    self.disconnect(REASON_WRONG_APP_IDENTIFIER, true, time);
                    return;
                }
                self.handle.set_remote_identity(response.unique_identifier, response.hail);
                self.send_library(LibraryMessage::ConnectionEstablished, &[]);
                self.set_status(ConnectionStatus::Connected, "", time);
            }
            // Our ConnectionEstablished was lost.
            ConnectionStatus::Connected => self.send_library(LibraryMessage::ConnectionEstablished, &[]),
            _ => {}
        }
    }

    pub(super) fn on_connection_established(&mut self, time: Instant) {
        if self.status == ConnectionStatus::RespondedConnect {
            self.set_status(ConnectionStatus::Connected, "", time);
        }
    }

    pub(super) fn on_disconnect(&mut self, payload: &[u8], time: Instant) {
        let reason = decode_payload::<DisconnectPayload>(payload)
            .map(|payload| payload.reason)
            .unwrap_or_else(|_| String::from("Disconnected by remote host"));
        tracing::debug!("{} disconnected: {}", self.handle.remote_address(), reason);
        self.disconnect(&reason, false, time);
    }
}
