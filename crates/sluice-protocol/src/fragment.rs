//! Fragment header and payload splitting.
//!
//! A message too large for one datagram is cut into chunks of equal size (the last
//! one may be shorter). Every chunk travels as an ordinary message on the chosen
//! channel with the fragment flag set in its header and this prefix in its payload:
//!
//! ```text
//! var-u32 group | var-u32 total bits | var-u32 chunk size | var-u32 count | var-u32 index
//! ```

use sluice_core::{
    bit_buffer::BitBuffer,
    constants::{HEADER_BYTE_SIZE, MAX_FRAGMENTATION_GROUPS},
    error::{DecodingErrorKind, Result},
    message_pool::{MessagePool, SharedPayload},
};

/// Prefix of every fragment payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Group id shared by all fragments of one message, in `1..=MAX_FRAGMENTATION_GROUPS`.
    pub group: u32,
    /// Bit length of the reassembled message.
    pub total_bits: u32,
    /// Bytes carried by every fragment except possibly the last.
    pub chunk_size: u32,
    /// Number of fragments in the group.
    pub count: u32,
    /// Position of this fragment.
    pub index: u32,
}

impl FragmentHeader {
    /// Bytes of the reassembled message.
    pub fn total_bytes(&self) -> usize {
        (self.total_bits as usize).div_ceil(8)
    }

    /// Bytes this fragment must carry.
    pub fn chunk_len(&self) -> usize {
        let offset = self.index as usize * self.chunk_size as usize;
        (self.total_bytes() - offset).min(self.chunk_size as usize)
    }

    /// Appends the header.
    pub fn encode(&self, buffer: &mut BitBuffer) {
        buffer.write_var_u32(self.group);
        buffer.write_var_u32(self.total_bits);
        buffer.write_var_u32(self.chunk_size);
        buffer.write_var_u32(self.count);
        buffer.write_var_u32(self.index);
    }

    /// Reads and validates a header.
    pub fn decode(buffer: &mut BitBuffer) -> Result<Self> {
        let header = Self {
            group: buffer.read_var_u32()?,
            total_bits: buffer.read_var_u32()?,
            chunk_size: buffer.read_var_u32()?,
            count: buffer.read_var_u32()?,
            index: buffer.read_var_u32()?,
        };
        let consistent = header.group >= 1
            && header.group <= MAX_FRAGMENTATION_GROUPS
            && header.chunk_size > 0
            && header.count as usize == header.total_bytes().div_ceil(header.chunk_size as usize)
            && header.index < header.count;
        if !consistent {
            return Err(DecodingErrorKind::Fragment.into());
        }
        Ok(header)
    }
}

/// Hands out fragment group ids, wrapping from `MAX_FRAGMENTATION_GROUPS` back to 1.
#[derive(Debug, Default)]
pub struct FragmentGroupIds {
    last: u32,
}

impl FragmentGroupIds {
    /// Returns the next group id.
    pub fn next_id(&mut self) -> u32 {
        self.last = self.last % MAX_FRAGMENTATION_GROUPS + 1;
        self.last
    }
}

fn var_size(value: u64) -> usize {
    (64 - value.max(1).leading_zeros() as usize).div_ceil(7)
}

/// Largest chunk that keeps one fragment, including both headers, within `mtu`.
pub fn best_chunk_size(group: u32, total_bytes: usize, mtu: usize) -> usize {
    let prefix = var_size(group as u64)
        + var_size(total_bytes as u64 * 8)
        + var_size(mtu as u64)
        + 2 * var_size(total_bytes as u64);
    mtu.saturating_sub(HEADER_BYTE_SIZE + prefix).max(1)
}

/// Splits `payload` into fragment payloads for group `group`.
///
/// Each returned payload holds a fragment header followed by its chunk, and is
/// sized to fit `mtu` once the message header is added.
pub fn split_payload(
    payload: &SharedPayload,
    group: u32,
    mtu: usize,
    pool: &MessagePool,
) -> Vec<SharedPayload> {
    let bytes = payload.as_slice();
    let chunk_size = best_chunk_size(group, bytes.len(), mtu);
    let count = bytes.len().div_ceil(chunk_size);

    bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let header = FragmentHeader {
                group,
                total_bits: payload.length_bits() as u32,
                chunk_size: chunk_size as u32,
                count: count as u32,
                index: index as u32,
            };
            let mut buffer = BitBuffer::from_storage(pool.acquire(chunk_size + 16));
            header.encode(&mut buffer);
            buffer.write_bytes(chunk);
            let bits = buffer.length_bits();
            SharedPayload::new(buffer.into_bytes(), bits)
        })
        .collect()
}
