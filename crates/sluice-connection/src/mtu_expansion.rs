//! Automatic MTU expansion.
//!
//! A connection starts at the configured MTU and, when `auto_expand_mtu` is set,
//! probes for a larger one with padded `ExpandMtuRequest` datagrams. The remote
//! answers every probe that arrives with `ExpandMtuSuccess`.
//!
//! # Algorithm
//!
//! Binary search between the largest size known to work (`low`, starting at the
//! configured MTU) and the largest size not yet known to fail (`high`, starting at
//! the protocol maximum):
//! - every `expand_mtu_frequency` one probe of `(low + high) / 2` bytes is sent;
//! - a success raises `low` and the connection MTU with it;
//! - a probe unanswered for a whole period lowers `high` below its size and counts
//!   as one failed attempt;
//! - the search stops once the bounds are within `CONVERGE_THRESHOLD` bytes of each
//!   other or after `expand_mtu_fail_attempts` failures.

use std::time::{Duration, Instant};

use sluice_core::{config::Config, constants::PROTOCOL_MAX_MTU};

/// The search stops when fewer than this many bytes separate the bounds.
pub const CONVERGE_THRESHOLD: usize = 10;

/// MTU search state of one connection.
#[derive(Debug)]
pub struct MtuExpansion {
    enabled: bool,
    current: usize,
    low: usize,
    high: usize,
    frequency: Duration,
    max_fail_attempts: u32,
    fail_attempts: u32,
    last_probe: Instant,
    outstanding: Option<(usize, Instant)>,
    finalized: bool,
}

impl MtuExpansion {
    /// Creates the search state from `config`.
    pub fn new(config: &Config, time: Instant) -> Self {
        let mtu = config.maximum_transmission_unit();
        Self {
            enabled: config.auto_expand_mtu(),
            current: mtu,
            low: mtu,
            high: PROTOCOL_MAX_MTU,
            frequency: config.expand_mtu_frequency(),
            max_fail_attempts: config.expand_mtu_fail_attempts(),
            fail_attempts: 0,
            last_probe: time,
            outstanding: None,
            finalized: false,
        }
    }

    /// MTU currently used for outgoing datagrams.
    pub fn current_mtu(&self) -> usize {
        self.current
    }

    /// Returns true once the search stopped.
    pub fn is_finalized(&self) -> bool {
        self.finalized || !self.enabled
    }

    /// Lower bound of the search.
    pub fn low_bound(&self) -> usize {
        self.low
    }

    /// Upper bound of the search.
    pub fn high_bound(&self) -> usize {
        self.high
    }

    /// Advances the search; returns the size of a probe to send now, if any.
    pub fn poll(&mut self, time: Instant) -> Option<usize> {
        if self.is_finalized() {
            return None;
        }

        if let Some((size, sent)) = self.outstanding {
            if time.saturating_duration_since(sent) > self.frequency {
                self.high = self.high.min(size.saturating_sub(1));
                self.fail_attempts = self.fail_attempts.saturating_add(1);
                self.outstanding = None;
                self.last_probe = time;
                tracing::trace!("MTU probe of {} bytes unanswered ({} failures)", size, self.fail_attempts);
                if self.fail_attempts >= self.max_fail_attempts {
                    self.finalize();
                }
            }
            return None;
        }

        if self.high.saturating_sub(self.low) < CONVERGE_THRESHOLD {
            self.finalize();
            return None;
        }

        if time.saturating_duration_since(self.last_probe) < self.frequency {
            return None;
        }

        let size = (self.low + self.high) / 2;
        self.outstanding = Some((size, time));
        self.last_probe = time;
        Some(size)
    }

    /// Handles an `ExpandMtuSuccess` for `size`.
    ///
    /// Returns true if the connection MTU grew.
    pub fn process_success(&mut self, size: usize, time: Instant) -> bool {
        match self.outstanding {
            Some((pending, _)) if pending == size => {
                self.outstanding = None;
                self.last_probe = time;
                if size > self.low {
                    self.low = size;
                    self.current = size;
                    tracing::debug!("MTU expanded to {} bytes", size);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    fn finalize(&mut self) {
        self.finalized = true;
        self.outstanding = None;
        self.current = self.low;
        tracing::debug!("MTU search finished at {} bytes", self.current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fail_attempts: u32) -> Config {
        Config::builder("mtu")
            .auto_expand_mtu(true)
            .expand_mtu_frequency(Duration::from_millis(100))
            .expand_mtu_fail_attempts(fail_attempts)
            .build()
            .unwrap()
    }

    #[test]
    fn test_probe_after_frequency_and_success_raises_mtu() {
        let start = Instant::now();
        let mut mtu = MtuExpansion::new(&config(5), start);
        assert_eq!(mtu.poll(start), None);

        let time = start + Duration::from_millis(150);
        let size = mtu.poll(time).expect("probe");
        assert_eq!(size, (1408 + PROTOCOL_MAX_MTU) / 2);
        assert_eq!(mtu.poll(time), None);

        assert!(mtu.process_success(size, time));
        assert_eq!(mtu.current_mtu(), size);
        assert!(!mtu.process_success(size, time));
    }

    #[test]
    fn test_unanswered_probe_lowers_high_bound() {
        let start = Instant::now();
        let mut mtu = MtuExpansion::new(&config(5), start);
        let time = start + Duration::from_millis(150);
        let size = mtu.poll(time).unwrap();

        assert_eq!(mtu.poll(time + Duration::from_millis(300)), None);
        assert_eq!(mtu.high_bound(), size - 1);
        assert_eq!(mtu.current_mtu(), 1408);
    }

    #[test]
    fn test_gives_up_after_fail_attempts() {
        let start = Instant::now();
        let mut mtu = MtuExpansion::new(&config(2), start);
        let mut time = start;
        for _ in 0..20 {
            time += Duration::from_millis(150);
            mtu.poll(time);
        }
        assert!(mtu.is_finalized());
        assert_eq!(mtu.current_mtu(), 1408);
    }

    #[test]
    fn test_converges_when_every_probe_succeeds() {
        let start = Instant::now();
        let mut mtu = MtuExpansion::new(&config(5), start);
        let mut time = start;
        for _ in 0..40 {
            time += Duration::from_millis(150);
            if let Some(size) = mtu.poll(time) {
                mtu.process_success(size, time);
            }
        }
        assert!(mtu.is_finalized());
        assert!(PROTOCOL_MAX_MTU - mtu.current_mtu() < CONVERGE_THRESHOLD);
    }

    #[test]
    fn test_disabled_never_probes() {
        let config = Config::builder("mtu").build().unwrap();
        let start = Instant::now();
        let mut mtu = MtuExpansion::new(&config, start);
        assert_eq!(mtu.poll(start + Duration::from_secs(60)), None);
        assert!(mtu.is_finalized());
    }

    #[test]
    fn test_unbounded_fail_attempts_end_by_convergence() {
        let start = Instant::now();
        let mut mtu = MtuExpansion::new(&config(u32::MAX), start);
        let mut time = start;
        for _ in 0..200 {
            time += Duration::from_millis(150);
            mtu.poll(time);
        }
        assert!(mtu.is_finalized());
        assert!(mtu.high_bound() - mtu.low_bound() < CONVERGE_THRESHOLD);
        assert_eq!(mtu.current_mtu(), 1408);
    }
}
