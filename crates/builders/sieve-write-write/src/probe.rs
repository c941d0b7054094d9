use sieve_core::access::{flush, serialize, write};
use sieve_core::timer::Timer;

/// Times a victim write that follows a candidate write.
pub trait CollisionProbe {
    /// Flushes `victim`, writes `candidate`, then returns the time of a write to `victim`.
    ///
    /// # Safety
    ///
    /// `victim` and `candidate` must be valid for writes.
    unsafe fn time_write_pair(&self, victim: *mut u8, candidate: *mut u8) -> u64;
}

/// Hardware [`CollisionProbe`].
pub struct TimedCollisionProbe<'a> {
    timer: &'a dyn Timer,
}

impl<'a> TimedCollisionProbe<'a> {
    /// Creates a probe measuring with `timer`.
    pub fn new(timer: &'a dyn Timer) -> Self {
        TimedCollisionProbe { timer }
    }
}

impl CollisionProbe for TimedCollisionProbe<'_> {
    #[inline(never)]
    unsafe fn time_write_pair(&self, victim: *mut u8, candidate: *mut u8) -> u64 {
        unsafe {
            serialize();
            flush(victim);
            write(candidate, 0x5a);
            serialize();
            let start = self.timer.timestamp();
            write(victim, 0xa5);
            serialize();
            self.timer.timestamp().saturating_sub(start)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::timer::{new_timer, probe};

    #[test]
    fn test_write_pair_on_real_memory() -> anyhow::Result<()> {
        let timer = new_timer(probe())?;
        let mut buf = vec![0u8; 8192];
        let victim = buf.as_mut_ptr();
        let candidate = unsafe { victim.add(4096) };
        let _ = unsafe { TimedCollisionProbe::new(&*timer).time_write_pair(victim, candidate) };
        assert_eq!(buf[0], 0xa5);
        assert_eq!(buf[4096], 0x5a);
        Ok(())
    }
}
