//! Utility functions and types used throughout Sieve.
//!
//! - [`Size`] - Memory size representation
//! - Constants for cache and page geometry ([`PAGE_SIZE`], [`CL_SIZE`], ...)
//! - Progress reporting utilities ([`NamedProgress`])
//! - Random number generation ([`Rng`])
//! - OS capabilities: core pinning, privilege checks, CPU topology

mod cancelable_thread;
mod constants;
mod named_progress;
mod rng;
mod size;
mod system;

pub use self::cancelable_thread::*;
pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;
pub use self::size::Size;
pub use self::system::{current_cpu, is_root, kernel_version, physical_cores, pin_to_core};

/// Arithmetic mean of a sample, `None` for an empty sample.
pub fn mean(samples: &[u64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
}

/// Integer base-2 logarithm, `0` for `0`.
pub const fn log2(x: usize) -> u32 {
    if x == 0 { 0 } else { usize::BITS - 1 - x.leading_zeros() }
}

/// Macro for retrying operations until they succeed.
///
/// This macro continuously executes a closure until it returns `Ok`, logging errors
/// for each failed attempt. **Warning**: This creates an infinite loop if the operation
/// never succeeds.
#[macro_export]
macro_rules! retry {
    ($f:expr) => {{
        let mut f = $f;
        loop {
            match f() {
                Ok(x) => break x,
                Err(e) => {
                    log::trace!("retry! block failed: {}", e);
                }
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::{log2, mean};

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[10, 20, 30]), Some(20.0));
        assert_eq!(mean(&[1, 2]), Some(1.5));
    }

    #[test]
    fn test_log2() {
        assert_eq!(log2(0), 0);
        assert_eq!(log2(1), 0);
        assert_eq!(log2(64), 6);
        assert_eq!(log2(2048), 11);
        assert_eq!(log2(2047), 10);
    }

    #[test]
    fn test_retry_until_ok() {
        let mut calls = 0;
        let v: u32 = retry!(|| {
            calls += 1;
            if calls < 3 { Err("not yet") } else { Ok(7) }
        });
        assert_eq!(v, 7);
        assert_eq!(calls, 3);
    }
}
