use std::arch::x86_64::_mm_mfence;

use super::{Timer, TimerError, TimerKind};

/// Nanosecond timer backed by `CLOCK_MONOTONIC`.
pub struct Monotonic;

fn now() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ret == 0).then(|| ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

impl Monotonic {
    /// Creates the timer after checking that the clock can be read.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Clock`] if `clock_gettime` fails.
    pub fn new() -> Result<Self, TimerError> {
        match now() {
            Some(_) => Ok(Monotonic),
            None => Err(std::io::Error::last_os_error().into()),
        }
    }
}

impl Timer for Monotonic {
    #[inline(always)]
    fn timestamp(&self) -> u64 {
        unsafe { _mm_mfence() };
        let time = now().unwrap_or(0);
        unsafe { _mm_mfence() };
        time
    }

    fn kind(&self) -> TimerKind {
        TimerKind::Monotonic
    }
}
