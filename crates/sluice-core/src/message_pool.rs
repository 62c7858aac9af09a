use std::sync::Arc;

use parking_lot::Mutex;

/// Immutable message bytes shared by every holder of one sent message.
///
/// A broadcast hands the same payload to each recipient connection, and reliable
/// channels keep a handle until the message is acknowledged. The storage goes back to
/// the pool when the last holder releases it.
#[derive(Clone)]
pub struct SharedPayload {
    data: Arc<Vec<u8>>,
    bit_length: usize,
}

impl SharedPayload {
    /// Wraps `data` holding `bit_length` meaningful bits.
    pub fn new(data: Vec<u8>, bit_length: usize) -> Self {
        debug_assert!(bit_length.div_ceil(8) <= data.len());
        Self { data: Arc::new(data), bit_length }
    }

    /// Wraps whole bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let bit_length = data.len() * 8;
        Self::new(data, bit_length)
    }

    /// Payload bytes; the last one may be partially used.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Payload length in bytes, rounded up.
    pub fn len(&self) -> usize {
        self.bit_length.div_ceil(8)
    }

    /// Returns true if the payload holds no bits.
    pub fn is_empty(&self) -> bool {
        self.bit_length == 0
    }

    /// Payload length in bits.
    pub fn length_bits(&self) -> usize {
        self.bit_length
    }

    /// Number of live holders of the underlying storage.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Drops this handle; the last handle returns its storage to `pool`.
    pub fn release(self, pool: &MessagePool) {
        if let Ok(data) = Arc::try_unwrap(self.data) {
            pool.release(data);
        }
    }
}

impl AsRef<[u8]> for SharedPayload {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for SharedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPayload")
            .field("length_bits", &self.bit_length)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Thread-safe recycler for message storage.
///
/// Application threads create outgoing messages from it and hand incoming messages
/// back to it; the network thread draws receive buffers from it and returns sent
/// payloads. A buffer is either held by a message or sitting in the pool, and the
/// pool never holds more than `max_cached` buffers.
#[derive(Debug)]
pub struct MessagePool {
    cache: Mutex<Vec<Vec<u8>>>,
    max_cached: usize,
    enabled: bool,
}

impl MessagePool {
    /// Creates a pool caching up to `max_cached` buffers; a disabled pool never caches.
    pub fn new(enabled: bool, max_cached: usize) -> Self {
        let capacity = if enabled { max_cached } else { 0 };
        Self { cache: Mutex::new(Vec::with_capacity(capacity)), max_cached, enabled }
    }

    /// Returns a cleared buffer with at least `capacity` bytes of room.
    pub fn acquire(&self, capacity: usize) -> Vec<u8> {
        if self.enabled {
            if let Some(mut buffer) = self.cache.lock().pop() {
                buffer.reserve(capacity);
                return buffer;
            }
        }
        Vec::with_capacity(capacity)
    }

    /// Hands `buffer` back for reuse.
    pub fn release(&self, mut buffer: Vec<u8>) {
        if !self.enabled {
            return;
        }
        let mut cache = self.cache.lock();
        if cache.len() < self.max_cached {
            buffer.clear();
            cache.push(buffer);
        }
    }

    /// Number of cached buffers.
    pub fn available(&self) -> usize {
        self.cache.lock().len()
    }

    /// Drops every cached buffer.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
