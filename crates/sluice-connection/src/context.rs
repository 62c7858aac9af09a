use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use sluice_core::{config::Config, message_pool::MessagePool};
use sluice_protocol::fragment::FragmentGroupIds;

/// State shared by a peer, its network thread and every connection handle.
#[derive(Debug)]
pub struct PeerContext {
    config: Config,
    pool: MessagePool,
    unique_identifier: u64,
    group_ids: Mutex<FragmentGroupIds>,
    flush_requested: AtomicBool,
}

impl PeerContext {
    /// Creates the context, drawing a random peer identifier.
    pub fn new(config: Config) -> Arc<Self> {
        let pool = MessagePool::new(config.use_message_recycling(), config.recycled_cache_max_count());
        Arc::new(Self {
            config,
            pool,
            unique_identifier: rand::random(),
            group_ids: Mutex::new(FragmentGroupIds::default()),
            flush_requested: AtomicBool::new(false),
        })
    }

    /// The peer's immutable configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Buffer recycler for outgoing and incoming messages.
    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    /// Random identifier sent in handshakes.
    pub fn unique_identifier(&self) -> u64 {
        self.unique_identifier
    }

    /// Next fragment group id.
    ///
    /// Ids are peer-wide so a broadcast can hand the same fragments to every recipient.
    pub fn next_fragment_group(&self) -> u32 {
        self.group_ids.lock().next_id()
    }

    /// Asks the network thread to send queued messages on its next tick.
    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
    }

    /// Returns whether queued messages should go out this tick, clearing a pending request.
    pub fn take_flush(&self) -> bool {
        self.config.auto_flush_send_queue() || self.flush_requested.swap(false, Ordering::AcqRel)
    }
}
