//! Reassembly of fragmented messages.
//!
//! Messages larger than the connection MTU are split by the sender into a group of
//! equally sized chunks (see `sluice_protocol::fragment`). Each chunk travels as an
//! ordinary message on the sender's channel, so by the time a fragment reaches this
//! module it has already passed that channel's duplicate filtering and ordering.
//!
//! # Fragment Lifecycle
//!
//! 1. **First fragment**: a `FragmentGroup` is created, sized to the declared total,
//!    with an `AckWindow` of `count` bits recording which indices are present.
//! 2. **Further fragments**: each chunk is copied to its offset; a repeated index is
//!    ignored.
//! 3. **Completion**: when the presence count equals the declared count the group is
//!    removed and its buffer becomes one application message.
//! 4. **Limits**: a first fragment declaring more than the connection's maximum
//!    message size, or arriving while the table already holds its maximum number of
//!    groups, is rejected before any storage is reserved.
//! 5. **Teardown**: groups die with their connection. Groups fed by unreliable
//!    channels can never be completed once a chunk is lost, so those are also evicted
//!    after `UNRELIABLE_FRAGMENT_TIMEOUT`.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use sluice_core::{ack_window::AckWindow, bit_buffer::BitBuffer, message_pool::MessagePool};
use sluice_protocol::fragment::FragmentHeader;

/// Incomplete groups fed by unreliable channels are dropped after this long.
pub const UNRELIABLE_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reassembly context for one fragmented message.
#[derive(Debug)]
pub struct FragmentGroup {
    total_bits: u32,
    chunk_size: u32,
    received: AckWindow,
    data: Vec<u8>,
    reliable: bool,
    created_at: Instant,
}

impl FragmentGroup {
    fn new(header: &FragmentHeader, storage: Vec<u8>, reliable: bool, created_at: Instant) -> Self {
        let mut data = storage;
        data.clear();
        data.resize(header.total_bytes(), 0);
        Self {
            total_bits: header.total_bits,
            chunk_size: header.chunk_size,
            received: AckWindow::new(header.count as usize),
            data,
            reliable,
            created_at,
        }
    }

    fn matches(&self, header: &FragmentHeader) -> bool {
        self.total_bits == header.total_bits
            && self.chunk_size == header.chunk_size
            && self.received.capacity() == header.count as usize
    }

    /// Number of fragments received so far.
    pub fn received_count(&self) -> usize {
        self.received.count()
    }

    /// Returns true once every fragment is present.
    pub fn is_complete(&self) -> bool {
        self.received.count() == self.received.capacity()
    }
}

/// Result of feeding one fragment to the table.
#[derive(Debug, PartialEq)]
pub enum FragmentOutcome {
    /// The group still misses fragments.
    Pending,
    /// The fragment completed its group.
    Complete(BitBuffer),
    /// The fragment was a repeat, contradicted its group or exceeded a limit and was
    /// ignored.
    Rejected,
}

/// Fragment groups of one connection, keyed by group id.
#[derive(Debug)]
pub struct FragmentTable {
    groups: HashMap<u32, FragmentGroup>,
    max_message_bytes: usize,
    max_groups: usize,
}

impl FragmentTable {
    /// Creates an empty table accepting messages up to `max_message_bytes` and at most
    /// `max_groups` concurrent reassemblies.
    pub fn new(max_message_bytes: usize, max_groups: usize) -> Self {
        Self { groups: HashMap::new(), max_message_bytes, max_groups }
    }

    /// Number of groups being reassembled.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if no group is being reassembled.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Stores the chunk that follows `header` in `buffer`.
    ///
    /// `buffer` must be positioned right after the fragment header.
    pub fn insert(
        &mut self,
        header: &FragmentHeader,
        buffer: &mut BitBuffer,
        reliable: bool,
        pool: &MessagePool,
        time: Instant,
    ) -> FragmentOutcome {
        let chunk_len = header.chunk_len();
        if buffer.remaining_bits() < chunk_len * 8 {
            tracing::warn!(
                "Fragment {}/{} of group {} is truncated, dropping",
                header.index,
                header.count,
                header.group
            );
            return FragmentOutcome::Rejected;
        }

        if !self.groups.contains_key(&header.group) {
            if header.total_bytes() > self.max_message_bytes {
                tracing::warn!(
                    "Fragment group {} declares {} bytes, above the {} byte limit, dropping",
                    header.group,
                    header.total_bytes(),
                    self.max_message_bytes
                );
                return FragmentOutcome::Rejected;
            }
            if self.groups.len() >= self.max_groups {
                tracing::warn!(
                    "Fragment group {} exceeds the limit of {} concurrent groups, dropping",
                    header.group,
                    self.max_groups
                );
                return FragmentOutcome::Rejected;
            }
        }

        let group = self
            .groups
            .entry(header.group)
            .or_insert_with(|| FragmentGroup::new(header, pool.acquire(header.total_bytes()), reliable, time));

        if !group.matches(header) {
            tracing::warn!("Fragment of group {} disagrees with the group's first fragment, dropping", header.group);
            return FragmentOutcome::Rejected;
        }
        let index = header.index as usize;
        if group.received.get(index) {
            return FragmentOutcome::Rejected;
        }

        let offset = index * group.chunk_size as usize;
        if buffer.read_bytes_into(&mut group.data[offset..offset + chunk_len]).is_err() {
            return FragmentOutcome::Rejected;
        }
        group.received.set(index, true);

        if !group.is_complete() {
            return FragmentOutcome::Pending;
        }
        match self.groups.remove(&header.group) {
            Some(group) => FragmentOutcome::Complete(BitBuffer::from_parts(group.data, group.total_bits as usize)),
            None => FragmentOutcome::Pending,
        }
    }

    /// Drops incomplete unreliable groups older than `UNRELIABLE_FRAGMENT_TIMEOUT`.
    pub fn evict_stale(&mut self, pool: &MessagePool, time: Instant) {
        let stale: Vec<u32> = self
            .groups
            .iter()
            .filter(|(_, group)| {
                !group.reliable && time.saturating_duration_since(group.created_at) > UNRELIABLE_FRAGMENT_TIMEOUT
            })
            .map(|(id, _)| *id)
            .collect();

        if !stale.is_empty() {
            tracing::debug!("Evicting {} stale unreliable fragment group(s)", stale.len());
            for id in stale {
                if let Some(group) = self.groups.remove(&id) {
                    pool.release(group.data);
                }
            }
        }
    }

    /// Discards every group without assembling it.
    pub fn clear(&mut self, pool: &MessagePool) {
        for (_, group) in self.groups.drain() {
            pool.release(group.data);
        }
    }
}
