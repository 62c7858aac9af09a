use std::{convert::TryFrom, fmt};

use sluice_core::error::{DecodingErrorKind, ErrorKind};

/// Handshake and lifecycle state of one connection.
///
/// Outbound connections run `None -> InitiatedConnect -> Connected`; inbound ones run
/// `None -> ReceivedInitiation -> [RespondedAwaitingApproval ->] RespondedConnect ->
/// Connected`. Every connection ends with `Disconnecting -> Disconnected`, or jumps
/// straight to `Disconnected` when the handshake gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// No handshake traffic yet.
    #[default]
    None = 0,
    /// Connect sent, waiting for the response.
    InitiatedConnect = 1,
    /// Connect received, not yet answered.
    ReceivedInitiation = 2,
    /// Connect received, waiting for the application to approve or deny.
    RespondedAwaitingApproval = 3,
    /// Response sent, waiting for the initiator's confirmation.
    RespondedConnect = 4,
    /// Handshake complete; application data flows.
    Connected = 5,
    /// Disconnect in progress.
    Disconnecting = 6,
    /// Terminal state.
    Disconnected = 7,
}

impl ConnectionStatus {
    /// Returns true while the handshake is still running.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnectionStatus::InitiatedConnect
                | ConnectionStatus::ReceivedInitiation
                | ConnectionStatus::RespondedAwaitingApproval
                | ConnectionStatus::RespondedConnect
        )
    }

    /// Returns true once application data may flow.
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }

    /// Returns true once teardown has begun.
    pub fn is_disconnecting(self) -> bool {
        matches!(self, ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected)
    }
}

impl TryFrom<u8> for ConnectionStatus {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ConnectionStatus::None,
            1 => ConnectionStatus::InitiatedConnect,
            2 => ConnectionStatus::ReceivedInitiation,
            3 => ConnectionStatus::RespondedAwaitingApproval,
            4 => ConnectionStatus::RespondedConnect,
            5 => ConnectionStatus::Connected,
            6 => ConnectionStatus::Disconnecting,
            7 => ConnectionStatus::Disconnected,
            _ => {
                return Err(DecodingErrorKind::InvalidValue { kind: "ConnectionStatus", value }.into())
            }
        })
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::None => "None",
            ConnectionStatus::InitiatedConnect => "InitiatedConnect",
            ConnectionStatus::ReceivedInitiation => "ReceivedInitiation",
            ConnectionStatus::RespondedAwaitingApproval => "RespondedAwaitingApproval",
            ConnectionStatus::RespondedConnect => "RespondedConnect",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnecting => "Disconnecting",
            ConnectionStatus::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}
