//! Memory headroom monitor.
//!
//! Gates radio start-up on a minimum amount of free memory and runs
//! periodic housekeeping from the event loop. Housekeeping runs when
//! forced, every `interval` processed events, or when
//! [`RECLAIM_PERIOD_MS`] has passed since the last pass. If headroom is
//! still below the threshold afterwards, a few extra passes run with
//! short pauses in between.

use embedded_hal::delay::DelayNs;

use crate::config::{EMERGENCY_PASSES, EMERGENCY_PAUSE_MS, RECLAIM_PERIOD_MS};
use crate::error::Error;

/// Source of the headroom metric.
pub trait Headroom {
    /// Currently free bytes.
    fn free(&mut self) -> usize;

    /// Release whatever can be released.
    fn reclaim(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HealthStatus {
    Ok,
    Low,
}

/// Snapshot reported by [`HealthMonitor::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Health {
    pub free: usize,
    pub min_free: usize,
    pub reclaims: u32,
    pub status: HealthStatus,
}

pub struct HealthMonitor<M> {
    memory: M,
    threshold: usize,
    interval: u32,
    operations: u32,
    reclaims: u32,
    min_free: usize,
    last_reclaim_ms: u64,
}

impl<M: Headroom> HealthMonitor<M> {
    /// `interval` of 0 disables the event-count trigger.
    pub fn new(memory: M, threshold: usize, interval: u32) -> Self {
        Self {
            memory,
            threshold,
            interval,
            operations: 0,
            reclaims: 0,
            min_free: usize::MAX,
            last_reclaim_ms: 0,
        }
    }

    /// Refuse to start below the threshold.
    pub fn check_init(&mut self, now_ms: u64) -> Result<(), Error> {
        let free = self.sample();
        self.last_reclaim_ms = now_ms;
        if free < self.threshold {
            error!("Insufficient memory: {} < {}", free, self.threshold);
            return Err(Error::InsufficientHeadroom { free });
        }
        info!("Memory OK: {} bytes free", free);
        Ok(())
    }

    pub fn on_operation(&mut self) {
        self.operations = self.operations.wrapping_add(1);
    }

    pub fn operations(&self) -> u32 {
        self.operations
    }

    /// Run housekeeping if due. Returns `true` when a pass ran.
    pub fn maybe_reclaim<D: DelayNs>(&mut self, delay: &mut D, force: bool, now_ms: u64) -> bool {
        let by_count = self.interval != 0 && self.operations % self.interval == 0;
        let by_time = now_ms.saturating_sub(self.last_reclaim_ms) > RECLAIM_PERIOD_MS;
        if !(force || by_count || by_time) {
            return false;
        }

        self.memory.reclaim();
        self.reclaims = self.reclaims.wrapping_add(1);
        self.last_reclaim_ms = now_ms;

        let free = self.sample();
        if free < self.threshold {
            warn!("Low memory after reclaim: {} bytes", free);
            for _ in 0..EMERGENCY_PASSES {
                self.memory.reclaim();
                delay.delay_ms(EMERGENCY_PAUSE_MS);
            }
            let free = self.sample();
            debug!("Emergency reclaim done: {} bytes", free);
        }
        true
    }

    pub fn health(&mut self) -> Health {
        let free = self.sample();
        Health {
            free,
            min_free: self.min_free,
            reclaims: self.reclaims,
            status: if free > self.threshold {
                HealthStatus::Ok
            } else {
                HealthStatus::Low
            },
        }
    }

    fn sample(&mut self) -> usize {
        let free = self.memory.free();
        self.min_free = self.min_free.min(free);
        free
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &M {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDelay, FakeMemory};

    #[test]
    fn init_refused_below_threshold() {
        let mut m = HealthMonitor::new(FakeMemory::steady(10_000), 40_000, 8);
        assert_eq!(
            m.check_init(0),
            Err(Error::InsufficientHeadroom { free: 10_000 })
        );
    }

    #[test]
    fn init_accepted_at_threshold() {
        let mut m = HealthMonitor::new(FakeMemory::steady(40_000), 40_000, 8);
        assert!(m.check_init(0).is_ok());
    }

    #[test]
    fn reclaims_every_interval_operations() {
        let mut m = HealthMonitor::new(FakeMemory::steady(80_000), 40_000, 4);
        let mut d = FakeDelay::default();
        m.check_init(0).unwrap();
        let mut ran = 0;
        for _ in 0..8 {
            m.on_operation();
            if m.maybe_reclaim(&mut d, false, 0) {
                ran += 1;
            }
        }
        assert_eq!(ran, 2);
        assert_eq!(m.health().reclaims, 2);
    }

    #[test]
    fn zero_interval_disables_count_trigger() {
        let mut m = HealthMonitor::new(FakeMemory::steady(80_000), 40_000, 0);
        let mut d = FakeDelay::default();
        m.check_init(0).unwrap();
        for _ in 0..20 {
            m.on_operation();
            assert!(!m.maybe_reclaim(&mut d, false, 100));
        }
    }

    #[test]
    fn reclaims_after_period_elapses() {
        let mut m = HealthMonitor::new(FakeMemory::steady(80_000), 40_000, 0);
        let mut d = FakeDelay::default();
        m.check_init(1_000).unwrap();
        assert!(!m.maybe_reclaim(&mut d, false, 1_000 + RECLAIM_PERIOD_MS));
        assert!(m.maybe_reclaim(&mut d, false, 1_001 + RECLAIM_PERIOD_MS));
    }

    #[test]
    fn forced_reclaim_always_runs() {
        let mut m = HealthMonitor::new(FakeMemory::steady(80_000), 40_000, 0);
        let mut d = FakeDelay::default();
        assert!(m.maybe_reclaim(&mut d, true, 0));
        assert!(d.pauses_ms.is_empty());
    }

    #[test]
    fn low_headroom_triggers_emergency_passes() {
        // init sample, then post-reclaim sample is low.
        let mut m = HealthMonitor::new(FakeMemory::new(&[50_000, 30_000, 35_000]), 40_000, 0);
        let mut d = FakeDelay::default();
        m.check_init(0).unwrap();
        assert!(m.maybe_reclaim(&mut d, true, 0));
        assert_eq!(d.pauses_ms, [EMERGENCY_PAUSE_MS; EMERGENCY_PASSES as usize]);
        assert_eq!(m.memory().reclaims, 1 + EMERGENCY_PASSES as u32);
    }

    #[test]
    fn health_tracks_minimum_and_verdict() {
        let mut m = HealthMonitor::new(FakeMemory::new(&[60_000, 30_000, 45_000]), 40_000, 0);
        let mut d = FakeDelay::default();
        m.check_init(0).unwrap();
        m.maybe_reclaim(&mut d, true, 0);
        let h = m.health();
        assert_eq!(h.free, 45_000);
        assert_eq!(h.min_free, 30_000);
        assert_eq!(h.status, HealthStatus::Ok);

        let mut low = HealthMonitor::new(FakeMemory::steady(40_000), 40_000, 0);
        assert_eq!(low.health().status, HealthStatus::Low);
    }
}
