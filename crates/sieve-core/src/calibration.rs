//! Hit/miss threshold calibration.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::access::{access, flush_b};
use crate::config::{EvictionStrategy, SieveConfig};
use crate::memory::{BytePointer, Memory};
use crate::probe::evict_with;
use crate::timer::{Stopwatch, Timer};
use crate::util::PAGE_SIZE;

/// Timing thresholds separating cache hits from misses.
///
/// An access is a hit if its time lies strictly between `hit` and `miss`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Lower bound, anything at or below is treated as a glitch
    pub hit: u64,
    /// Upper bound of a hit
    pub miss: u64,
}

impl Thresholds {
    /// Derives thresholds from the average hit and miss times.
    ///
    /// The miss threshold is biased towards the hit side:
    /// `(miss_avg + 2 * hit_avg) / 3`.
    pub fn from_averages(hit_avg: u64, miss_avg: u64) -> Self {
        Thresholds {
            hit: 0,
            miss: (miss_avg + 2 * hit_avg) / 3,
        }
    }

    /// Replaces values with configured overrides.
    pub fn with_overrides(mut self, config: &SieveConfig) -> Self {
        if let Some(hit) = config.hit_threshold {
            self.hit = hit;
        }
        if let Some(miss) = config.miss_threshold {
            self.miss = miss;
        }
        self
    }

    /// `true` if `time` is classified as a cache hit.
    pub fn is_hit(&self, time: u64) -> bool {
        time > self.hit && time < self.miss
    }
}

/// Times a single access to `addr`.
///
/// # Safety
///
/// `addr` must be valid for reads.
#[inline(always)]
pub unsafe fn time_access(timer: &dyn Timer, addr: *const u8) -> u64 {
    let mut sw = Stopwatch::new(timer);
    sw.measure_start();
    unsafe { access(addr) };
    sw.measure_end()
}

/// Measures average hit and miss times with flushes as eviction.
///
/// # Errors
///
/// Returns an I/O error if the probe page cannot be mapped.
pub fn calibrate_flush_reload(
    timer: &dyn Timer,
    config: &SieveConfig,
) -> Result<Thresholds, std::io::Error> {
    let mem = Memory::mmap(PAGE_SIZE, 1)?;
    let addr = mem.addr(PAGE_SIZE / 2);
    let rounds = config.calibration_rounds.max(1) as u64;

    let mut reload = 0u64;
    unsafe { access(addr) };
    for _ in 0..rounds {
        reload += unsafe { time_access(timer, addr) };
    }

    let mut flush_reload = 0u64;
    unsafe { flush_b(addr) };
    for _ in 0..rounds {
        flush_reload += unsafe { time_access(timer, addr) };
        unsafe { flush_b(addr) };
    }
    mem.dealloc();

    debug!("reload sum {}, flush+reload sum {}", reload, flush_reload);
    let thresholds = finish(reload / rounds, flush_reload / rounds, config);
    Ok(thresholds)
}

/// Measures average hit and miss times with an eviction set as eviction.
///
/// # Safety
///
/// `victim` and every address of `set` must be valid for reads.
pub unsafe fn calibrate_evict_reload(
    timer: &dyn Timer,
    set: &[*mut u8],
    victim: *const u8,
    strategy: EvictionStrategy,
    config: &SieveConfig,
) -> Thresholds {
    let rounds = config.calibration_rounds.max(1) as u64;
    let mut reload = 0u64;
    let mut evict_reload = 0u64;
    unsafe {
        access(victim);
        for _ in 0..rounds {
            reload += time_access(timer, victim);
        }
        evict_with(strategy, set);
        for _ in 0..rounds {
            evict_reload += time_access(timer, victim);
            evict_with(strategy, set);
        }
    }
    finish(reload / rounds, evict_reload / rounds, config)
}

fn finish(hit_avg: u64, miss_avg: u64, config: &SieveConfig) -> Thresholds {
    let thresholds = Thresholds::from_averages(hit_avg, miss_avg).with_overrides(config);
    info!(
        "Calibration: hit avg {}, miss avg {} => thresholds {:?}",
        hit_avg, miss_avg, thresholds
    );
    thresholds
}

/// Outcome of [`threshold_separation`].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Separation {
    /// Trials per case
    pub trials: usize,
    /// Cached accesses classified below the miss threshold
    pub hits_below: usize,
    /// Flushed accesses at or above the miss threshold
    pub misses_above: usize,
}

impl Separation {
    /// Fraction of correctly classified cached accesses.
    pub fn hit_rate(&self) -> f64 {
        self.hits_below as f64 / self.trials.max(1) as f64
    }

    /// Fraction of correctly classified flushed accesses.
    pub fn miss_rate(&self) -> f64 {
        self.misses_above as f64 / self.trials.max(1) as f64
    }
}

/// Checks how well `thresholds` separate cached from flushed accesses.
///
/// # Errors
///
/// Returns an I/O error if the probe page cannot be mapped.
pub fn threshold_separation(
    timer: &dyn Timer,
    thresholds: &Thresholds,
    trials: usize,
) -> Result<Separation, std::io::Error> {
    let mem = Memory::mmap(PAGE_SIZE, 1)?;
    let addr = mem.addr(PAGE_SIZE / 2);
    let mut hits_below = 0;
    let mut misses_above = 0;
    for _ in 0..trials {
        unsafe { access(addr) };
        if unsafe { time_access(timer, addr) } < thresholds.miss {
            hits_below += 1;
        }
        unsafe { flush_b(addr) };
        if unsafe { time_access(timer, addr) } >= thresholds.miss {
            misses_above += 1;
        }
    }
    mem.dealloc();
    Ok(Separation {
        trials,
        hits_below,
        misses_above,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::tests::{PhasedTimer, StepTimer};
    use crate::timer::{new_timer, probe};

    #[test]
    fn test_threshold_formula() {
        let t = Thresholds::from_averages(60, 240);
        assert_eq!(t, Thresholds { hit: 0, miss: 120 });
        assert!(t.is_hit(80));
        assert!(!t.is_hit(120));
        assert!(!t.is_hit(0));
    }

    #[test]
    fn test_overrides_win() {
        let config = SieveConfig {
            hit_threshold: Some(20),
            miss_threshold: Some(180),
            ..Default::default()
        };
        let t = Thresholds::from_averages(60, 240).with_overrides(&config);
        assert_eq!(t, Thresholds { hit: 20, miss: 180 });
    }

    #[test]
    fn test_calibrate_with_step_timer() -> anyhow::Result<()> {
        let timer = StepTimer::new(30);
        let config = SieveConfig {
            calibration_rounds: 100,
            ..Default::default()
        };
        let t = calibrate_flush_reload(&timer, &config)?;
        assert_eq!(t.miss, 30);
        Ok(())
    }

    #[test]
    fn test_calibrate_evict_reload_formula() {
        let rounds = 50;
        // reloads take 30 cycles, evicted reloads 150
        let timer = PhasedTimer::new(30, 2 * rounds, 150);
        let config = SieveConfig {
            calibration_rounds: rounds as usize,
            ..Default::default()
        };
        let mut buf = vec![0u8; 64 * 32];
        let lines: Vec<*mut u8> = (0..32).map(|i| unsafe { buf.as_mut_ptr().add(i * 64) }).collect();
        let t = unsafe {
            calibrate_evict_reload(
                &timer,
                &lines[1..],
                lines[0],
                EvictionStrategy::EVICTION,
                &config,
            )
        };
        assert_eq!(t, Thresholds { hit: 0, miss: 70 });

        let overridden = SieveConfig {
            miss_threshold: Some(90),
            ..config
        };
        let timer = PhasedTimer::new(30, 2 * rounds, 150);
        let t = unsafe {
            calibrate_evict_reload(
                &timer,
                &lines[1..],
                lines[0],
                EvictionStrategy::EVICTION,
                &overridden,
            )
        };
        assert_eq!(t.miss, 90);
    }

    #[test]
    #[ignore = "needs a quiescent, pinned core"]
    fn test_threshold_separation() -> anyhow::Result<()> {
        crate::util::pin_to_core(0)?;
        let timer = new_timer(probe())?;
        let thresholds = calibrate_flush_reload(&*timer, &SieveConfig::default())?;
        let sep = threshold_separation(&*timer, &thresholds, 10_000)?;
        assert!(sep.hit_rate() >= 0.95, "{:?}", sep);
        assert!(sep.miss_rate() >= 0.95, "{:?}", sep);
        Ok(())
    }
}
