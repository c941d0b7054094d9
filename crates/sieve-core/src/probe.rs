//! Flush+Reload, Evict+Reload and Prime+Probe.

use crate::access::{access, flush_b};
use crate::calibration::{Thresholds, time_access};
use crate::config::{EvictionStrategy, SieveConfig};
use crate::timer::{Stopwatch, Timer};

/// Calls `f` with every index `strategy` visits in a set of `len` addresses.
///
/// Windows of `d + 1` consecutive indices are visited `c + 1` times, the
/// window start advances by `l` up to `s`. Indices past `len` are skipped.
#[inline(always)]
fn walk(strategy: EvictionStrategy, len: usize, mut f: impl FnMut(usize)) {
    for s in (0..=strategy.s).step_by(strategy.l.max(1)) {
        for _ in 0..=strategy.c {
            for d in 0..=strategy.d {
                if s + d < len {
                    f(s + d);
                }
            }
        }
    }
}

/// Accesses `set` following `strategy`.
///
/// # Safety
///
/// Every address of `set` must be valid for reads.
#[inline]
pub unsafe fn evict_with(strategy: EvictionStrategy, set: &[*mut u8]) {
    walk(strategy, set.len(), |i| unsafe { access(set[i]) });
}

/// Cache attack primitives bound to a timer and calibrated thresholds.
pub struct CacheProbe<'a> {
    timer: &'a dyn Timer,
    thresholds: Thresholds,
    eviction: EvictionStrategy,
    prime: EvictionStrategy,
}

impl<'a> CacheProbe<'a> {
    /// Creates the probe. `ways` parameterizes the default prime strategy.
    pub fn new(
        timer: &'a dyn Timer,
        thresholds: Thresholds,
        config: &SieveConfig,
        ways: usize,
    ) -> Self {
        CacheProbe {
            timer,
            thresholds,
            eviction: config.eviction_strategy(),
            prime: config.prime_strategy(ways),
        }
    }

    /// Thresholds used for classification.
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Reloads `addr` and flushes it again. Returns `true` on a cache hit.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads.
    pub unsafe fn flush_reload(&self, addr: *const u8) -> bool {
        let time = unsafe { time_access(self.timer, addr) };
        unsafe { flush_b(addr) };
        self.thresholds.is_hit(time)
    }

    /// Evicts the victim set with the eviction strategy.
    ///
    /// # Safety
    ///
    /// Every address of `set` must be valid for reads.
    pub unsafe fn evict(&self, set: &[*mut u8]) {
        unsafe { evict_with(self.eviction, set) };
    }

    /// Reloads `addr` and evicts it with `set`. Returns `true` on a cache hit.
    ///
    /// # Safety
    ///
    /// `addr` and every address of `set` must be valid for reads.
    pub unsafe fn evict_reload(&self, addr: *const u8, set: &[*mut u8]) -> bool {
        let time = unsafe { time_access(self.timer, addr) };
        unsafe { self.evict(set) };
        self.thresholds.is_hit(time)
    }

    /// Fills the cache set of `set` with the prime strategy.
    ///
    /// # Safety
    ///
    /// Every address of `set` must be valid for reads.
    pub unsafe fn prime(&self, set: &[*mut u8]) {
        unsafe { evict_with(self.prime, set) };
    }

    /// Times a prime pass over `set`. High values mean the victim touched the set.
    ///
    /// # Safety
    ///
    /// Every address of `set` must be valid for reads.
    pub unsafe fn prime_probe(&self, set: &[*mut u8]) -> u64 {
        let mut sw = Stopwatch::new(self.timer);
        sw.measure_start();
        unsafe { self.prime(set) };
        sw.measure_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::tests::StepTimer;

    #[test]
    fn test_walk_windows() {
        let strategy = EvictionStrategy {
            c: 1,
            d: 1,
            l: 2,
            s: 4,
        };
        let mut visited = vec![];
        walk(strategy, 32, |i| visited.push(i));
        assert_eq!(visited, vec![0, 1, 0, 1, 2, 3, 2, 3, 4, 5, 4, 5]);
    }

    #[test]
    fn test_walk_bounded_by_len() {
        let mut visited = vec![];
        walk(EvictionStrategy::EVICTION, 3, |i| visited.push(i));
        assert_eq!(visited.len(), 5 * 3);
        assert!(visited.iter().all(|&i| i < 3));
    }

    #[test]
    fn test_evict_with_valid_memory() {
        let mut buf = vec![0u8; 64 * 32];
        let set: Vec<*mut u8> = (0..32).map(|i| unsafe { buf.as_mut_ptr().add(i * 64) }).collect();
        unsafe { evict_with(EvictionStrategy::EVICTION, &set) };
    }

    #[test]
    fn test_flush_reload_classification() {
        let timer = StepTimer::new(50);
        let config = SieveConfig::default();
        let buf = [0u8; 64];
        let hit = CacheProbe::new(&timer, Thresholds { hit: 0, miss: 100 }, &config, 16);
        assert!(unsafe { hit.flush_reload(buf.as_ptr()) });
        let miss = CacheProbe::new(&timer, Thresholds { hit: 0, miss: 40 }, &config, 16);
        assert!(unsafe { !miss.flush_reload(buf.as_ptr()) });
    }

    #[test]
    fn test_prime_probe_times_pass() {
        let timer = StepTimer::new(7);
        let config = SieveConfig::default();
        let mut buf = vec![0u8; 64 * 16];
        let set: Vec<*mut u8> = (0..16).map(|i| unsafe { buf.as_mut_ptr().add(i * 64) }).collect();
        let probe = CacheProbe::new(&timer, Thresholds { hit: 0, miss: 100 }, &config, 16);
        assert_eq!(unsafe { probe.prime_probe(&set) }, 7);
    }
}
