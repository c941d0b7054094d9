use std::arch::x86_64::{__rdtscp, _mm_lfence, _mm_mfence, _rdtsc};

use log::warn;

use super::{Timer, TimerError, TimerKind};
use crate::geometry::cpuid;

/// Cycle counter timer.
///
/// Reads the TSC with `rdtscp` between two `mfence`s. CPUs without `rdtscp`
/// get `lfence; rdtsc; lfence` instead, which serializes less strictly.
pub struct Rdtscp {
    has_rdtscp: bool,
}

impl Rdtscp {
    /// Creates the cycle counter timer.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Unsupported`] if the CPU has no TSC.
    pub fn new() -> Result<Self, TimerError> {
        if !cpuid::has_tsc() {
            return Err(TimerError::Unsupported(TimerKind::Native));
        }
        let has_rdtscp = cpuid::has_rdtscp();
        if !has_rdtscp {
            warn!("RDTSCP not available, falling back to fenced RDTSC. Recalibrate thresholds.");
        }
        Ok(Rdtscp { has_rdtscp })
    }
}

impl Timer for Rdtscp {
    #[inline(always)]
    fn timestamp(&self) -> u64 {
        unsafe {
            if self.has_rdtscp {
                let mut aux = 0;
                _mm_mfence();
                let time = __rdtscp(&mut aux);
                _mm_mfence();
                time
            } else {
                _mm_mfence();
                _mm_lfence();
                let time = _rdtsc();
                _mm_lfence();
                time
            }
        }
    }

    fn kind(&self) -> TimerKind {
        TimerKind::Native
    }
}
