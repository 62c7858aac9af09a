//! Payload layouts of the transport's own messages.

use std::{
    convert::TryFrom,
    io::{self, Cursor, Write},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sluice_core::{
    bit_buffer::{BitBuffer, Decode, Encode},
    constants::HEADER_BYTE_SIZE,
    error::Result,
};

use crate::{
    delivery::{EnumConverter, MessageType},
    sequence::SequenceNumber,
};

/// Handshake payload of `Connect` and `ConnectResponse`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Application identifier; must match the receiver's.
    pub app_identifier: String,
    /// Random identifier of the sending peer.
    pub unique_identifier: u64,
    /// Application hail bytes.
    pub hail: Vec<u8>,
}

impl Encode for HandshakePayload {
    fn encode(&self, buffer: &mut BitBuffer) {
        buffer.write_value(&self.app_identifier);
        buffer.write_value(&self.unique_identifier);
        buffer.write_value(&self.hail);
    }
}

impl Decode for HandshakePayload {
    fn decode(buffer: &mut BitBuffer) -> Result<Self> {
        Ok(Self {
            app_identifier: buffer.read_value()?,
            unique_identifier: buffer.read_value()?,
            hail: buffer.read_value()?,
        })
    }
}

/// Payload of `Disconnect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectPayload {
    /// Human readable reason.
    pub reason: String,
}

impl Encode for DisconnectPayload {
    fn encode(&self, buffer: &mut BitBuffer) {
        buffer.write_value(&self.reason);
    }
}

impl Decode for DisconnectPayload {
    fn decode(buffer: &mut BitBuffer) -> Result<Self> {
        Ok(Self { reason: buffer.read_value()? })
    }
}

/// Encodes `value` through its schema into a fresh byte vector plus its bit length.
pub fn encode_payload<T: Encode>(value: &T) -> (Vec<u8>, usize) {
    let mut buffer = BitBuffer::new();
    buffer.write_value(value);
    let bits = buffer.length_bits();
    (buffer.into_bytes(), bits)
}

/// Decodes a schema payload from raw bytes.
pub fn decode_payload<T: Decode>(payload: &[u8]) -> Result<T> {
    BitBuffer::from_bytes(payload.to_vec()).read_value()
}

/// One acknowledged (message type, sequence) pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Acknowledgement {
    /// Channel the acknowledged message was sent on.
    pub message_type: MessageType,
    /// Its sequence number.
    pub sequence: SequenceNumber,
}

/// Wire size of one acknowledgement.
pub const ACKNOWLEDGEMENT_SIZE: usize = 3;

/// Appends acknowledgements as (u8 type, u16 sequence) triples.
pub fn encode_acknowledgements<W: Write>(
    buffer: &mut W,
    acks: &[Acknowledgement],
) -> io::Result<()> {
    for ack in acks {
        buffer.write_u8(ack.message_type.to_u8())?;
        buffer.write_u16::<BigEndian>(ack.sequence)?;
    }
    Ok(())
}

/// Reads every acknowledgement in an `Acknowledge` payload.
pub fn decode_acknowledgements(payload: &[u8]) -> Result<Vec<Acknowledgement>> {
    let mut cursor = Cursor::new(payload);
    let mut acks = Vec::with_capacity(payload.len() / ACKNOWLEDGEMENT_SIZE);
    while (cursor.position() as usize) + ACKNOWLEDGEMENT_SIZE <= payload.len() {
        let message_type = MessageType::try_from(cursor.read_u8()?)?;
        let sequence = cursor.read_u16::<BigEndian>()?;
        acks.push(Acknowledgement { message_type, sequence });
    }
    Ok(acks)
}

/// Payload of `ExpandMtuRequest`: the probed datagram size, zero padded so the whole
/// message (header included) is exactly that size.
pub fn encode_mtu_probe(size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size.saturating_sub(HEADER_BYTE_SIZE).max(4)];
    payload[..4].copy_from_slice(&(size as u32).to_be_bytes());
    payload
}

/// Reads the probed size from an `ExpandMtuRequest` or `ExpandMtuSuccess` payload.
pub fn decode_mtu_size(payload: &[u8]) -> Result<usize> {
    Ok(Cursor::new(payload).read_u32::<BigEndian>()? as usize)
}

/// Payload of `ExpandMtuSuccess`.
pub fn encode_mtu_success(size: usize) -> Vec<u8> {
    (size as u32).to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryMethod, LibraryMessage};

    #[test]
    fn test_handshake_payload() {
        let payload = HandshakePayload {
            app_identifier: "login".into(),
            unique_identifier: 0xfeed_beef,
            hail: vec![1, 2, 3],
        };
        let (bytes, _) = encode_payload(&payload);
        assert_eq!(decode_payload::<HandshakePayload>(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_acknowledgements() {
        let acks = vec![
            Acknowledgement {
                message_type: MessageType::User { method: DeliveryMethod::ReliableOrdered, channel: 0 },
                sequence: 1023,
            },
            Acknowledgement {
                message_type: MessageType::User { method: DeliveryMethod::ReliableSequenced, channel: 4 },
                sequence: 5,
            },
        ];
        let mut bytes = Vec::new();
        encode_acknowledgements(&mut bytes, &acks).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[..3], &[67, 0x03, 0xff]);
        assert_eq!(decode_acknowledgements(&bytes).unwrap(), acks);
    }

    #[test]
    fn test_acknowledgement_with_bad_type() {
        let bytes = [LibraryMessage::Ping.to_u8() - 1, 0, 1];
        assert!(decode_acknowledgements(&bytes).is_err());
    }

    #[test]
    fn test_mtu_probe() {
        let probe = encode_mtu_probe(1500);
        assert_eq!(probe.len() + HEADER_BYTE_SIZE, 1500);
        assert_eq!(decode_mtu_size(&probe).unwrap(), 1500);
        assert_eq!(decode_mtu_size(&encode_mtu_success(1500)).unwrap(), 1500);
    }
}
