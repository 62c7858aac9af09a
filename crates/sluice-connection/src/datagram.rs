//! Packing of messages into datagrams.

use sluice_core::{constants::CHECKSUM_SIZE, message_pool::MessagePool};
use sluice_protocol::{
    checksum::append_checksum,
    header::{write_message, MessageHeader},
};

/// Coalesces consecutive messages into datagrams no larger than the MTU.
///
/// A message larger than the MTU on its own (an oversized unreliable message or an
/// MTU probe) still goes out, alone in its datagram.
#[derive(Debug)]
pub struct DatagramWriter {
    buffer: Vec<u8>,
    mtu: usize,
    use_checksums: bool,
}

impl DatagramWriter {
    /// Creates a writer for datagrams of at most `mtu` bytes.
    pub fn new(mtu: usize, use_checksums: bool) -> Self {
        Self { buffer: Vec::with_capacity(mtu), mtu, use_checksums }
    }

    /// Changes the datagram size limit for subsequent messages.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Room for messages in one datagram.
    pub fn capacity(&self) -> usize {
        let trailer = if self.use_checksums { CHECKSUM_SIZE } else { 0 };
        self.mtu.saturating_sub(trailer)
    }

    /// Returns true if no message is waiting.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends one message; returns the previous datagram if it had to be closed first.
    pub fn write(&mut self, header: &MessageHeader, payload: &[u8], pool: &MessagePool) -> Option<Vec<u8>> {
        let finished = if !self.buffer.is_empty() && self.buffer.len() + header.encoded_size() > self.capacity() {
            self.flush(pool)
        } else {
            None
        };
        if let Err(error) = write_message(&mut self.buffer, header, payload) {
            tracing::error!("Failed to write {:?}: {}", header.message_type, error);
        }
        finished
    }

    /// Closes the datagram being filled, if any.
    pub fn flush(&mut self, pool: &MessagePool) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.use_checksums {
            append_checksum(&mut self.buffer);
        }
        Some(std::mem::replace(&mut self.buffer, pool.acquire(self.mtu)))
    }
}
