//! CRC32 datagram trailer.

use crc32fast::Hasher;
use sluice_core::{
    constants::CHECKSUM_SIZE,
    error::{DecodingErrorKind, Result},
};

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Appends a big-endian CRC32 of the datagram to it.
pub fn append_checksum(datagram: &mut Vec<u8>) {
    let checksum = crc32(datagram);
    datagram.extend_from_slice(&checksum.to_be_bytes());
}

/// Verifies and strips the CRC32 trailer.
pub fn validate_and_strip_checksum(datagram: &[u8]) -> Result<&[u8]> {
    if datagram.len() < CHECKSUM_SIZE {
        return Err(DecodingErrorKind::Checksum.into());
    }
    let (payload, trailer) = datagram.split_at(datagram.len() - CHECKSUM_SIZE);
    let received = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32(payload);
    if received != computed {
        tracing::trace!("Checksum mismatch: received {:08x}, computed {:08x}", received, computed);
        return Err(DecodingErrorKind::Checksum.into());
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_append_and_validate() {
        let mut datagram = b"Hello, world!".to_vec();
        append_checksum(&mut datagram);
        assert_eq!(datagram.len(), 13 + CHECKSUM_SIZE);
        assert_eq!(validate_and_strip_checksum(&datagram).unwrap(), b"Hello, world!");
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut datagram = b"Hello, world!".to_vec();
        append_checksum(&mut datagram);
        datagram[2] ^= 0x10;
        assert!(validate_and_strip_checksum(&datagram).is_err());
        assert!(validate_and_strip_checksum(&[1, 2]).is_err());
    }
}
