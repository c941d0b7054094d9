use std::arch::x86_64::_mm_mfence;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::debug;

use super::{Timer, TimerError, TimerKind};
use crate::util::{CancelableJoinHandle, spawn_cancelable};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Coarse timer driven by a thread that increments a shared counter.
///
/// The counter is published with relaxed stores only, so readers may see a
/// stale value. The counting thread is stopped when the timer is dropped.
pub struct CountingThread {
    counter: Arc<AtomicU64>,
    _thread: CancelableJoinHandle<()>,
}

impl CountingThread {
    /// Spawns the counting thread and waits until it has started counting.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::CounterStalled`] if the counter stays at zero.
    pub fn new() -> Result<Self, TimerError> {
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let thread = spawn_cancelable(move |running| {
            let mut local = 0u64;
            while running.load(Ordering::Relaxed) {
                local = local.wrapping_add(1);
                c.store(local, Ordering::Relaxed);
            }
        });
        let start = Instant::now();
        while counter.load(Ordering::Relaxed) == 0 {
            if start.elapsed() > STARTUP_TIMEOUT {
                return Err(TimerError::CounterStalled);
            }
            std::hint::spin_loop();
        }
        debug!("Counting thread started after {:?}", start.elapsed());
        Ok(CountingThread {
            counter,
            _thread: thread,
        })
    }
}

impl Timer for CountingThread {
    #[inline(always)]
    fn timestamp(&self) -> u64 {
        unsafe { _mm_mfence() };
        let time = self.counter.load(Ordering::Relaxed);
        unsafe { _mm_mfence() };
        time
    }

    fn kind(&self) -> TimerKind {
        TimerKind::CountingThread
    }
}
