//! Serialized timestamp sources.
//!
//! All measurements in Sieve go through the [`Timer`] trait. Three backends
//! exist: the cycle counter ([`Rdtscp`]), the OS monotonic clock
//! ([`Monotonic`]) and a free-running counter thread ([`CountingThread`]).
//! [`probe`] picks the best backend the machine supports.

mod counting_thread;
mod monotonic;
mod rdtscp;

pub use self::counting_thread::CountingThread;
pub use self::monotonic::Monotonic;
pub use self::rdtscp::Rdtscp;

use std::fmt;
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::cpuid;

/// A serialized, monotonically non-decreasing timestamp source.
///
/// Implementations fence the read so that surrounding memory operations
/// cannot be reordered across it.
pub trait Timer: Send + Sync {
    /// Returns the current timestamp.
    fn timestamp(&self) -> u64;

    /// The backend behind this timer.
    fn kind(&self) -> TimerKind;
}

impl<T: Timer + ?Sized> Timer for Box<T> {
    fn timestamp(&self) -> u64 {
        (**self).timestamp()
    }

    fn kind(&self) -> TimerKind {
        (**self).kind()
    }
}

/// Available timer backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerKind {
    /// Cycle counter read with `rdtscp` (or fenced `rdtsc`)
    Native,
    /// `clock_gettime(CLOCK_MONOTONIC)` in nanoseconds
    Monotonic,
    /// Free-running counter incremented by a dedicated thread
    CountingThread,
}

impl FromStr for TimerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "rdtsc" | "rdtscp" => Ok(TimerKind::Native),
            "monotonic" | "clock" => Ok(TimerKind::Monotonic),
            "counting" | "counting-thread" | "thread" => Ok(TimerKind::CountingThread),
            other => Err(format!("unknown timer '{}'", other)),
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Native => write!(f, "native"),
            TimerKind::Monotonic => write!(f, "monotonic"),
            TimerKind::CountingThread => write!(f, "counting-thread"),
        }
    }
}

/// Errors that can occur while setting up a timer.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The CPU lacks the instructions this backend needs
    #[error("Timer {0} is not supported on this machine")]
    Unsupported(TimerKind),
    /// Reading the OS clock failed
    #[error("Failed to read monotonic clock: {0}")]
    Clock(#[from] std::io::Error),
    /// The counting thread did not start counting
    #[error("Counting thread did not start")]
    CounterStalled,
}

/// Picks the most precise timer backend available.
///
/// Prefers the cycle counter, then the monotonic clock and finally the
/// counting thread.
pub fn probe() -> TimerKind {
    if cpuid::has_tsc() {
        if !cpuid::has_invariant_tsc() {
            warn!("TSC is not invariant, cycle counts may drift with frequency scaling");
        }
        return TimerKind::Native;
    }
    match Monotonic::new() {
        Ok(_) => TimerKind::Monotonic,
        Err(e) => {
            warn!("Monotonic clock unusable ({}), using counting thread", e);
            TimerKind::CountingThread
        }
    }
}

/// Constructs a timer of the given kind.
///
/// # Errors
///
/// Returns [`TimerError`] if the backend is unavailable.
pub fn new_timer(kind: TimerKind) -> Result<Box<dyn Timer>, TimerError> {
    let timer: Box<dyn Timer> = match kind {
        TimerKind::Native => Box::new(Rdtscp::new()?),
        TimerKind::Monotonic => Box::new(Monotonic::new()?),
        TimerKind::CountingThread => Box::new(CountingThread::new()?),
    };
    info!("Using {} timer", timer.kind());
    Ok(timer)
}

/// Constructs the configured timer, or the probed one if none is configured.
///
/// # Errors
///
/// Returns [`TimerError`] if the backend is unavailable.
pub fn timer_from_config(kind: Option<TimerKind>) -> Result<Box<dyn Timer>, TimerError> {
    new_timer(kind.unwrap_or_else(probe))
}

/// Measures the time between [`Stopwatch::measure_start`] and
/// [`Stopwatch::measure_end`].
pub struct Stopwatch<'a> {
    timer: &'a dyn Timer,
    start: u64,
}

impl<'a> Stopwatch<'a> {
    /// Creates a stopwatch. Call [`Stopwatch::measure_start`] before measuring.
    pub fn new(timer: &'a dyn Timer) -> Self {
        Stopwatch { timer, start: 0 }
    }

    /// Captures a new baseline.
    #[inline(always)]
    pub fn measure_start(&mut self) {
        self.start = self.timer.timestamp();
    }

    /// Time elapsed since the last baseline.
    #[inline(always)]
    pub fn measure_end(&self) -> u64 {
        self.timer.timestamp().saturating_sub(self.start)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Advances by a fixed step on every read.
    pub(crate) struct StepTimer {
        now: AtomicU64,
        step: u64,
    }

    impl StepTimer {
        pub(crate) fn new(step: u64) -> Self {
            StepTimer {
                now: AtomicU64::new(0),
                step,
            }
        }
    }

    impl Timer for StepTimer {
        fn timestamp(&self) -> u64 {
            self.now.fetch_add(self.step, Ordering::Relaxed)
        }

        fn kind(&self) -> TimerKind {
            TimerKind::CountingThread
        }
    }

    /// Advances by `first` for the first `switch_after` reads, by `then` afterwards.
    pub(crate) struct PhasedTimer {
        now: AtomicU64,
        reads: AtomicU64,
        first: u64,
        switch_after: u64,
        then: u64,
    }

    impl PhasedTimer {
        pub(crate) fn new(first: u64, switch_after: u64, then: u64) -> Self {
            PhasedTimer {
                now: AtomicU64::new(0),
                reads: AtomicU64::new(0),
                first,
                switch_after,
                then,
            }
        }
    }

    impl Timer for PhasedTimer {
        fn timestamp(&self) -> u64 {
            let read = self.reads.fetch_add(1, Ordering::Relaxed);
            let step = if read < self.switch_after {
                self.first
            } else {
                self.then
            };
            self.now.fetch_add(step, Ordering::Relaxed)
        }

        fn kind(&self) -> TimerKind {
            TimerKind::CountingThread
        }
    }

    #[test]
    fn test_phased_timer() {
        let timer = PhasedTimer::new(10, 2, 100);
        let mut sw = Stopwatch::new(&timer);
        sw.measure_start();
        assert_eq!(sw.measure_end(), 10);
        sw.measure_start();
        assert_eq!(sw.measure_end(), 100);
    }

    #[test]
    fn test_timer_kind_parse() {
        assert_eq!("rdtscp".parse::<TimerKind>(), Ok(TimerKind::Native));
        assert_eq!("Monotonic".parse::<TimerKind>(), Ok(TimerKind::Monotonic));
        assert_eq!("counting-thread".parse::<TimerKind>(), Ok(TimerKind::CountingThread));
        assert!("hpet".parse::<TimerKind>().is_err());
        for kind in [
            TimerKind::Native,
            TimerKind::Monotonic,
            TimerKind::CountingThread,
        ] {
            assert_eq!(kind.to_string().parse::<TimerKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_stopwatch_delta() {
        let timer = StepTimer::new(5);
        let mut sw = Stopwatch::new(&timer);
        sw.measure_start();
        assert_eq!(sw.measure_end(), 5);
        assert_eq!(sw.measure_end(), 10);
    }

    #[test]
    fn test_probed_timer_monotonic() -> anyhow::Result<()> {
        let timer = new_timer(probe())?;
        let mut last = timer.timestamp();
        for _ in 0..1000 {
            let now = timer.timestamp();
            assert!(now >= last);
            last = now;
        }
        Ok(())
    }

    #[test]
    fn test_monotonic_advances() -> anyhow::Result<()> {
        let timer = Monotonic::new()?;
        let a = timer.timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.timestamp() > a);
        Ok(())
    }

    #[test]
    fn test_counting_thread_advances() -> anyhow::Result<()> {
        let timer = CountingThread::new()?;
        let a = timer.timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.timestamp() > a);
        Ok(())
    }
}
