//! Five-byte message header.
//!
//! ```text
//! +--------+----------------+----------------+
//! | type   | F|  sequence   | payload bits   |
//! | u8     | u16 (BE)       | u16 (BE)       |
//! +--------+----------------+----------------+
//! ```
//!
//! `F` is the fragment flag in the high bit of the sequence word; the sequence itself
//! uses the low ten bits. The payload that follows occupies `ceil(bits / 8)` bytes.

use std::{
    convert::TryFrom,
    io::{self, Cursor, Write},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sluice_core::{
    constants::{HEADER_BYTE_SIZE, NUM_SEQUENCE_NUMBERS},
    error::{DecodingErrorKind, Result},
};

use crate::{
    delivery::{EnumConverter, MessageType},
    sequence::SequenceNumber,
};

const FRAGMENT_FLAG: u16 = 0x8000;

/// Header preceding every message inside a datagram.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type and channel.
    pub message_type: MessageType,
    /// Whether the payload starts with a fragment header.
    pub is_fragment: bool,
    /// Channel sequence number; zero for unsequenced library messages.
    pub sequence: SequenceNumber,
    /// Payload length in bits.
    pub payload_bits: u16,
}

impl MessageHeader {
    /// Payload length in whole bytes.
    pub fn payload_bytes(&self) -> usize {
        (self.payload_bits as usize).div_ceil(8)
    }

    /// Size of this header plus its payload on the wire.
    pub fn encoded_size(&self) -> usize {
        HEADER_BYTE_SIZE + self.payload_bytes()
    }

    /// Appends the header to `buffer`.
    pub fn encode_into<W: Write>(&self, buffer: &mut W) -> io::Result<()> {
        debug_assert!(self.sequence < NUM_SEQUENCE_NUMBERS);
        let flag = if self.is_fragment { FRAGMENT_FLAG } else { 0 };
        buffer.write_u8(self.message_type.to_u8())?;
        buffer.write_u16::<BigEndian>(flag | self.sequence)?;
        buffer.write_u16::<BigEndian>(self.payload_bits)?;
        Ok(())
    }

    /// Reads a header at the cursor position.
    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let remaining = cursor.get_ref().len() - cursor.position() as usize;
        if remaining < HEADER_BYTE_SIZE {
            return Err(DecodingErrorKind::TruncatedHeader.into());
        }
        let message_type = MessageType::try_from(cursor.read_u8()?)?;
        let word = cursor.read_u16::<BigEndian>()?;
        let payload_bits = cursor.read_u16::<BigEndian>()?;
        Ok(Self {
            message_type,
            is_fragment: word & FRAGMENT_FLAG != 0,
            sequence: (word & !FRAGMENT_FLAG) % NUM_SEQUENCE_NUMBERS,
            payload_bits,
        })
    }
}

/// Reads one header and its payload bytes from `cursor`.
///
/// A payload that runs past the end of the datagram is an error; callers drop the
/// rest of the datagram since the message boundaries are lost.
pub fn read_message<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<(MessageHeader, &'a [u8])> {
    let header = MessageHeader::decode(cursor)?;
    let start = cursor.position() as usize;
    let data: &'a [u8] = *cursor.get_ref();
    let available = data.len() - start;
    let declared = header.payload_bytes();
    if declared > available {
        return Err(DecodingErrorKind::PayloadOverrun { declared, available }.into());
    }
    cursor.set_position((start + declared) as u64);
    Ok((header, &data[start..start + declared]))
}

/// Appends a header and its payload to `buffer`.
pub fn write_message(buffer: &mut Vec<u8>, header: &MessageHeader, payload: &[u8]) -> io::Result<()> {
    debug_assert_eq!(payload.len(), header.payload_bytes());
    header.encode_into(buffer)?;
    buffer.write_all(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryMethod, LibraryMessage};
    use sluice_core::error::ErrorKind;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader {
            message_type: MessageType::User { method: DeliveryMethod::ReliableOrdered, channel: 2 },
            is_fragment: true,
            sequence: 1023,
            payload_bits: 17,
        };
        let mut bytes = Vec::new();
        header.encode_into(&mut bytes).unwrap();
        assert_eq!(bytes, vec![69, 0x83, 0xff, 0x00, 17]);
        assert_eq!(header.payload_bytes(), 3);

        let decoded = MessageHeader::decode(&mut Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_truncated_header() {
        let bytes = [67u8, 0, 1, 0];
        let err = MessageHeader::decode(&mut Cursor::new(&bytes[..])).unwrap_err();
        assert!(matches!(err, ErrorKind::Decoding(DecodingErrorKind::TruncatedHeader)));
    }

    #[test]
    fn test_multiple_messages_in_one_datagram() {
        let ping = MessageHeader {
            message_type: MessageType::Library(LibraryMessage::Ping),
            is_fragment: false,
            sequence: 0,
            payload_bits: 8,
        };
        let data = MessageHeader {
            message_type: MessageType::User { method: DeliveryMethod::Unreliable, channel: 0 },
            is_fragment: false,
            sequence: 7,
            payload_bits: 16,
        };
        let mut datagram = Vec::new();
        write_message(&mut datagram, &ping, &[3]).unwrap();
        write_message(&mut datagram, &data, &[9, 9]).unwrap();

        let mut cursor = Cursor::new(datagram.as_slice());
        let (h1, p1) = read_message(&mut cursor).unwrap();
        let (h2, p2) = read_message(&mut cursor).unwrap();
        assert_eq!((h1, p1), (ping, &[3u8][..]));
        assert_eq!((h2, p2), (data, &[9u8, 9][..]));
        assert_eq!(cursor.position() as usize, datagram.len());
    }

    #[test]
    fn test_payload_overrun_rejected() {
        let header = MessageHeader {
            message_type: MessageType::Unconnected,
            is_fragment: false,
            sequence: 0,
            payload_bits: 80,
        };
        let mut datagram = Vec::new();
        header.encode_into(&mut datagram).unwrap();
        datagram.extend_from_slice(&[1, 2, 3]);
        let err = read_message(&mut Cursor::new(datagram.as_slice())).unwrap_err();
        assert!(matches!(
            err,
            ErrorKind::Decoding(DecodingErrorKind::PayloadOverrun { declared: 10, available: 3 })
        ));
    }
}
