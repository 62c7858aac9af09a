use std::ops::{Deref, DerefMut};

use sluice_core::{bit_buffer::BitBuffer, message_pool::SharedPayload};

/// Application message waiting to be sent.
///
/// Dereferences to [`BitBuffer`] for writing. Sending consumes the message, so a
/// message cannot be modified or sent again once it has been handed over.
#[derive(Debug, Default)]
pub struct OutgoingMessage {
    buffer: BitBuffer,
    receipt: Option<u32>,
}

impl OutgoingMessage {
    /// Creates a message over (possibly recycled) storage.
    pub fn from_storage(storage: Vec<u8>) -> Self {
        Self { buffer: BitBuffer::from_storage(storage), receipt: None }
    }

    /// Creates a message holding `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut message = Self::default();
        message.write_bytes(bytes);
        message
    }

    /// Requests a `Receipt(tag)` message once a reliable send is fully acknowledged.
    pub fn set_receipt(&mut self, tag: u32) {
        self.receipt = Some(tag);
    }

    /// Receipt tag, if any.
    pub fn receipt(&self) -> Option<u32> {
        self.receipt
    }

    /// Freezes the contents into a shareable payload.
    pub fn into_payload(self) -> (SharedPayload, Option<u32>) {
        let bits = self.buffer.length_bits();
        (SharedPayload::new(self.buffer.into_bytes(), bits), self.receipt)
    }
}

impl Deref for OutgoingMessage {
    type Target = BitBuffer;

    fn deref(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut BitBuffer {
        &mut self.buffer
    }
}
