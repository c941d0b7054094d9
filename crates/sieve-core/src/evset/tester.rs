use std::cell::Cell;

use log::trace;

use super::EvictionSet;
use crate::access::{access, mfence};
use crate::config::EvsetConfig;
use crate::retry;
use crate::timer::{Stopwatch, Timer};

/// Times a victim reload after traversing a candidate set.
pub trait EvictionProbe {
    /// Caches `victim`, walks `set` twice and returns the victim's reload time.
    ///
    /// # Safety
    ///
    /// `victim` and every address of `set` must be valid for reads.
    unsafe fn time_evicted_reload(&self, set: &[*mut u8], victim: *mut u8) -> u64;
}

/// Hardware [`EvictionProbe`].
pub struct TimedEvictionProbe<'a> {
    timer: &'a dyn Timer,
}

impl<'a> TimedEvictionProbe<'a> {
    /// Creates a probe measuring with `timer`.
    pub fn new(timer: &'a dyn Timer) -> Self {
        TimedEvictionProbe { timer }
    }
}

impl EvictionProbe for TimedEvictionProbe<'_> {
    unsafe fn time_evicted_reload(&self, set: &[*mut u8], victim: *mut u8) -> u64 {
        unsafe {
            access(victim);
            // first pass also touches the predecessor to defeat non-LRU replacement
            let mut prev = set.first().copied();
            for &addr in set {
                access(addr);
                if let Some(p) = prev {
                    access(p);
                }
                prev = Some(addr);
            }
            for &addr in set {
                access(addr);
            }
            mfence();
            let mut sw = Stopwatch::new(self.timer);
            sw.measure_start();
            access(victim);
            sw.measure_end()
        }
    }
}

/// Boolean oracle deciding whether a set evicts a victim.
pub trait EvictionOracle {
    /// `true` if traversing `set` evicts `victim`.
    fn evicts(&self, set: &EvictionSet, victim: *mut u8) -> bool;
}

/// Functional eviction test with plausibility filtering.
///
/// Samples outside the plausible window are instrumentation glitches and
/// are retried without bound.
pub struct EvictionTester<P: EvictionProbe> {
    probe: P,
    miss_threshold: u64,
    config: EvsetConfig,
    implausible: Cell<u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("implausible sample {0}")]
struct Implausible(u64);

impl<P: EvictionProbe> EvictionTester<P> {
    /// Creates a tester using the miss threshold from `config`.
    pub fn new(probe: P, config: &EvsetConfig) -> Self {
        EvictionTester {
            probe,
            miss_threshold: config.miss_threshold,
            config: config.clone(),
            implausible: Cell::new(0),
        }
    }

    /// Replaces the miss threshold, e.g. with a calibrated one.
    pub fn with_miss_threshold(mut self, miss_threshold: u64) -> Self {
        self.miss_threshold = miss_threshold;
        self
    }

    /// Threshold above which the victim counts as evicted.
    pub fn miss_threshold(&self) -> u64 {
        self.miss_threshold
    }

    /// Number of samples rejected as implausible so far.
    pub fn implausible_samples(&self) -> u64 {
        self.implausible.get()
    }

    /// First plausible victim reload time after traversing `set`.
    pub fn sample(&self, set: &EvictionSet, victim: *mut u8) -> u64 {
        retry!(|| {
            let time = unsafe { self.probe.time_evicted_reload(set.as_slice(), victim) };
            if self.config.plausible(time) {
                Ok(time)
            } else {
                self.implausible.set(self.implausible.get() + 1);
                Err(Implausible(time))
            }
        })
    }
}

impl<P: EvictionProbe> EvictionOracle for EvictionTester<P> {
    fn evicts(&self, set: &EvictionSet, victim: *mut u8) -> bool {
        let time = self.sample(set, victim);
        let evicted = time > self.miss_threshold;
        trace!(
            "test of {} addresses: {} cycles, evicted: {}",
            set.len(),
            time,
            evicted
        );
        evicted
    }
}

impl<T: EvictionOracle + ?Sized> EvictionOracle for &T {
    fn evicts(&self, set: &EvictionSet, victim: *mut u8) -> bool {
        (**self).evicts(set, victim)
    }
}
