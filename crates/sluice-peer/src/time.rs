use std::time::Instant;

/// Time source of a network thread.
///
/// Every timer of a peer (resends, pings, timeouts, handshake retries, simulated
/// latency) is measured against the instant the clock reports at the start of a tick.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}
