use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use super::{EvictionOracle, EvictionSet};
use crate::config::EvsetConfig;

/// Errors that can occur while reducing an eviction set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReductionError {
    /// The set is smaller than the associativity
    #[error("Eviction set has {len} addresses, need at least {associativity}")]
    TooSmall {
        /// Set length
        len: usize,
        /// Target length
        associativity: usize,
    },
    /// The set does not evict the victim in the first place
    #[error("Eviction set does not evict the victim")]
    NotFunctional,
    /// Every removal order failed within the attempt bound
    #[error("Reduction gave up after {attempts} failed attempts at the top level")]
    Exhausted {
        /// Failed attempts of the top level
        attempts: usize,
    },
}

/// Counters collected during a reduction.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReductionStats {
    /// Functional tests run
    pub tests: usize,
    /// Addresses permanently removed
    pub discarded: usize,
    /// Addresses put back after a failed removal
    pub reinserted: usize,
    /// Deepest level of nested removals
    pub max_depth: usize,
}

/// One level of nested trial removal.
#[derive(Default)]
struct Frame {
    /// Failed removals at this level
    attempts: usize,
    /// Address removed before descending, undone if the level below fails
    removed: Option<*mut u8>,
}

enum Step {
    /// Run the next iteration of the top frame
    Continue,
    /// The top frame failed
    Failed,
}

/// Shrinks `set` to exactly `config.associativity` addresses that still evict `victim`.
///
/// Each level removes the head address and descends. If the level below
/// succeeds, the removal is kept; if it fails, the address is put back at
/// the tail and the level tries the next head. A level fails after
/// `config.max_attempts()` failed removals, or as soon as the set stops
/// evicting. A set of the target size is tested twice before it is accepted.
///
/// On error, `set` may have been reordered but holds the same addresses.
///
/// # Errors
///
/// Returns [`ReductionError`] if the set cannot be reduced.
pub fn reduce<O: EvictionOracle>(
    set: &mut EvictionSet,
    victim: *mut u8,
    oracle: &O,
    config: &EvsetConfig,
) -> Result<ReductionStats, ReductionError> {
    let w = config.associativity;
    let max_attempts = config.max_attempts();
    let initial_len = set.len();
    if initial_len < w {
        return Err(ReductionError::TooSmall {
            len: initial_len,
            associativity: w,
        });
    }
    let mut stats = ReductionStats::default();
    if !evicts(oracle, set, victim, &mut stats) {
        return Err(ReductionError::NotFunctional);
    }
    info!("Reducing eviction set of {} addresses to {}", initial_len, w);

    let mut stack = vec![Frame::default()];
    // the root state was tested above
    let mut tested = true;
    while let Some(frame) = stack.last_mut() {
        let step = if frame.attempts >= max_attempts || set.len() < w {
            Step::Failed
        } else if !std::mem::take(&mut tested) && !evicts(oracle, set, victim, &mut stats) {
            Step::Failed
        } else if set.len() == w {
            if evicts(oracle, set, victim, &mut stats) {
                stats.discarded = initial_len - w;
                info!(
                    "Reduced to {} addresses with {} tests",
                    set.len(),
                    stats.tests
                );
                return Ok(stats);
            }
            Step::Failed
        } else {
            frame.removed = set.pop_front();
            stack.push(Frame::default());
            stats.max_depth = stats.max_depth.max(stack.len() - 1);
            Step::Continue
        };
        if let Step::Failed = step {
            let failed = stack.pop().map(|f| f.attempts).unwrap_or_default();
            let Some(parent) = stack.last_mut() else {
                debug!("Top level failed after {} attempts", failed);
                return Err(ReductionError::Exhausted { attempts: failed });
            };
            if let Some(addr) = parent.removed.take() {
                set.push(addr);
                stats.reinserted += 1;
            }
            parent.attempts += 1;
        }
    }
    Err(ReductionError::Exhausted {
        attempts: max_attempts,
    })
}

fn evicts<O: EvictionOracle>(
    oracle: &O,
    set: &EvictionSet,
    victim: *mut u8,
    stats: &mut ReductionStats,
) -> bool {
    stats.tests += 1;
    oracle.evicts(set, victim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;

    /// Evicts iff at least `w` of the addresses are congruent.
    struct CongruenceOracle {
        congruent: HashSet<usize>,
        w: usize,
        calls: Cell<usize>,
    }

    impl CongruenceOracle {
        fn new(congruent: &[usize], w: usize) -> Self {
            CongruenceOracle {
                congruent: congruent.iter().copied().collect(),
                w,
                calls: Cell::new(0),
            }
        }
    }

    impl EvictionOracle for CongruenceOracle {
        fn evicts(&self, set: &EvictionSet, _victim: *mut u8) -> bool {
            self.calls.set(self.calls.get() + 1);
            set.iter()
                .filter(|a| self.congruent.contains(&(*a as usize)))
                .count()
                >= self.w
        }
    }

    fn config(w: usize) -> EvsetConfig {
        EvsetConfig {
            associativity: w,
            ..Default::default()
        }
    }

    fn set_of(addrs: &[usize]) -> EvictionSet {
        addrs.iter().map(|&a| a as *mut u8).collect()
    }

    const VICTIM: *mut u8 = 0x10_0000 as *mut u8;

    #[test]
    fn test_reduce_to_congruent() -> anyhow::Result<()> {
        let congruent = [0x3000, 0x7000, 0xb000, 0xf000];
        let oracle = CongruenceOracle::new(&congruent, 4);
        let mut set = set_of(&(1..=20).map(|i| i * 0x1000).collect::<Vec<_>>());
        let stats = reduce(&mut set, VICTIM, &oracle, &config(4))?;
        assert_eq!(set.len(), 4);
        assert!(congruent.iter().all(|&a| set.contains(a as *const u8)));
        assert_eq!(stats.discarded, 16);
        assert_eq!(stats.tests, oracle.calls.get());
        Ok(())
    }

    #[test]
    fn test_already_minimal_unchanged() -> anyhow::Result<()> {
        let addrs = [0x3000, 0x7000, 0xb000];
        let oracle = CongruenceOracle::new(&addrs, 3);
        let mut set = set_of(&addrs);
        let stats = reduce(&mut set, VICTIM, &oracle, &config(3))?;
        assert_eq!(set, set_of(&addrs));
        assert_eq!(stats.discarded, 0);
        // initial test plus the double check
        assert_eq!(stats.tests, 2);
        Ok(())
    }

    #[test]
    fn test_too_small() {
        let oracle = CongruenceOracle::new(&[], 4);
        let mut set = set_of(&[0x1000, 0x2000]);
        assert_eq!(
            reduce(&mut set, VICTIM, &oracle, &config(4)),
            Err(ReductionError::TooSmall {
                len: 2,
                associativity: 4
            })
        );
        assert_eq!(oracle.calls.get(), 0);
    }

    #[test]
    fn test_not_functional() {
        let oracle = CongruenceOracle::new(&[0x1000], 2);
        let mut set = set_of(&[0x1000, 0x2000, 0x3000]);
        assert_eq!(
            reduce(&mut set, VICTIM, &oracle, &config(2)),
            Err(ReductionError::NotFunctional)
        );
    }

    #[test]
    fn test_exhausted_keeps_addresses() {
        // evicts only with all five addresses, so no removal can succeed
        let addrs = [0x1000, 0x2000, 0x3000, 0x4000, 0x5000];
        let oracle = CongruenceOracle::new(&addrs, 5);
        let mut set = set_of(&addrs);
        let res = reduce(&mut set, VICTIM, &oracle, &config(3));
        assert_eq!(res, Err(ReductionError::Exhausted { attempts: 5 }));
        let mut left: Vec<usize> = set.iter().map(|a| a as usize).collect();
        left.sort();
        assert_eq!(left, addrs.to_vec());
    }

    /// Inverts every seventh answer.
    struct FlakyOracle {
        inner: CongruenceOracle,
        calls: Cell<usize>,
    }

    impl EvictionOracle for FlakyOracle {
        fn evicts(&self, set: &EvictionSet, victim: *mut u8) -> bool {
            let n = self.calls.get();
            self.calls.set(n + 1);
            let truth = self.inner.evicts(set, victim);
            if n > 0 && n % 7 == 0 { !truth } else { truth }
        }
    }

    #[test]
    fn test_never_returns_non_functional_set() {
        let congruent = [0x2000, 0x5000, 0x9000];
        let oracle = FlakyOracle {
            inner: CongruenceOracle::new(&congruent, 3),
            calls: Cell::new(0),
        };
        let mut set = set_of(&(1..=12).map(|i| i * 0x1000).collect::<Vec<_>>());
        match reduce(&mut set, VICTIM, &oracle, &config(3)) {
            Ok(_) => {
                assert_eq!(set.len(), 3);
                assert!(oracle.inner.evicts(&set, VICTIM));
            }
            Err(e) => assert!(matches!(e, ReductionError::Exhausted { .. })),
        }
    }
}
