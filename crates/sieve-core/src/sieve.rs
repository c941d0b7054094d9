use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::EvsetConfig;
use crate::evset::{
    EvictionOracle, EvictionSet, EvictionSetBuilder, ReductionError, ReductionStats, reduce,
};
use crate::memory::{BytePointer, Memory};
use crate::util::{NamedProgress, PAGE_SIZE};

/// Default window of the incremental search: 100 pages
pub const DEFAULT_WINDOW: usize = 100 * PAGE_SIZE;

/// Main orchestrator for eviction set experiments.
///
/// Combines an [`EvictionSetBuilder`] with an [`EvictionOracle`]:
///
/// 1. The builder scans the pool for candidates colliding with the victim
/// 2. The oracle checks that the candidates evict the victim
/// 3. [`reduce`] shrinks the candidates to a minimal eviction set
pub struct Sieve<'a, E: std::error::Error, O: EvictionOracle> {
    builder: Box<dyn EvictionSetBuilder<Error = E> + 'a>,
    oracle: O,
    config: EvsetConfig,
    progress: Option<MultiProgress>,
}

/// Errors of a [`Sieve`] run.
#[derive(Debug, Error)]
pub enum SieveError<E: std::error::Error> {
    /// The builder failed
    #[error(transparent)]
    Build(E),
    /// The candidates do not evict the victim
    #[error("The obtained eviction set of {len} addresses does not evict the victim")]
    NotEvicting {
        /// Number of candidates found
        len: usize,
    },
    /// Reduction failed
    #[error(transparent)]
    Reduction(#[from] ReductionError),
}

impl<E: std::error::Error> Serialize for SieveError<E> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result of a successful run.
#[derive(Debug, Serialize)]
pub struct SieveReport {
    /// RFC 3339 timestamp of completion
    pub date: String,
    /// Builder that produced the candidates
    pub builder: &'static str,
    /// Candidates found before reduction
    pub candidates: usize,
    /// The minimal eviction set
    pub eviction_set: EvictionSet,
    /// Reduction counters
    pub reduction: ReductionStats,
    /// Time spent building
    pub build_time: Duration,
    /// Time spent reducing
    pub reduce_time: Duration,
}

impl<'a, E: std::error::Error, O: EvictionOracle> Sieve<'a, E, O> {
    /// Creates an orchestrator.
    pub fn new(
        builder: Box<dyn EvictionSetBuilder<Error = E> + 'a>,
        oracle: O,
        config: EvsetConfig,
    ) -> Self {
        Sieve {
            builder,
            oracle,
            config,
            progress: None,
        }
    }

    /// Reports progress of the incremental search.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builds over the whole pool, tests and reduces.
    ///
    /// # Errors
    ///
    /// Returns [`SieveError`] if any stage fails.
    pub fn run(&mut self, victim: *mut u8, pool: &Memory) -> Result<SieveReport, SieveError<E>> {
        let start = Instant::now();
        let mut set = self
            .builder
            .build(victim, pool)
            .map_err(SieveError::Build)?;
        let build_time = start.elapsed();
        let candidates = set.len();
        info!(
            "{} found {} candidates in {:?}",
            self.builder.name(),
            candidates,
            build_time
        );
        if !self.oracle.evicts(&set, victim) {
            return Err(SieveError::NotEvicting { len: candidates });
        }
        let start = Instant::now();
        let reduction = reduce(&mut set, victim, &self.oracle, &self.config)?;
        let reduce_time = start.elapsed();
        info!("Eviction set reduction took {:?}", reduce_time);
        Ok(SieveReport {
            date: chrono::Local::now().to_rfc3339(),
            builder: self.builder.name(),
            candidates,
            eviction_set: set,
            reduction,
            build_time,
            reduce_time,
        })
    }

    /// Scans the pool window by window until the merged candidates reduce.
    ///
    /// After each window the accumulated candidates are tested; once they
    /// evict the victim a reduction is attempted. A failed reduction keeps
    /// the candidates and continues with the next window.
    ///
    /// # Errors
    ///
    /// Returns [`SieveError::NotEvicting`] if the pool is exhausted.
    pub fn run_incremental(
        &mut self,
        victim: *mut u8,
        pool: &Memory,
        window: usize,
    ) -> Result<SieveReport, SieveError<E>> {
        let window = window.max(2 * PAGE_SIZE);
        let windows = pool.len().div_ceil(window);
        let p = self.progress.as_ref().map(|p| {
            p.add(
                ProgressBar::new(windows as u64).with_style(ProgressStyle::named_bar("Windows")),
            )
        });
        let start = Instant::now();
        let mut reduce_time = Duration::ZERO;
        let mut acc = EvictionSet::new();
        for offset in (0..pool.len()).step_by(window) {
            let end = (offset + window).min(pool.len());
            let part = self
                .builder
                .build_window(victim, pool, offset..end)
                .map_err(SieveError::Build)?;
            acc.merge(part);
            if let Some(p) = &p {
                p.inc(1);
                p.set_message(format!("{} candidates", acc.len()));
            }
            if acc.len() < self.config.associativity || !self.oracle.evicts(&acc, victim) {
                continue;
            }
            let candidates = acc.len();
            let reduce_start = Instant::now();
            let res = reduce(&mut acc, victim, &self.oracle, &self.config);
            reduce_time += reduce_start.elapsed();
            match res {
                Ok(reduction) => {
                    info!("Reduction was successful after {:?}", start.elapsed());
                    if let Some(p) = &p {
                        p.finish_and_clear();
                    }
                    return Ok(SieveReport {
                        date: chrono::Local::now().to_rfc3339(),
                        builder: self.builder.name(),
                        candidates,
                        eviction_set: acc,
                        reduction,
                        build_time: start.elapsed() - reduce_time,
                        reduce_time,
                    });
                }
                Err(e) => warn!("Reduction of {} candidates failed: {}", candidates, e),
            }
        }
        if let Some(p) = &p {
            p.finish_and_clear();
        }
        Err(SieveError::NotEvicting { len: acc.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::ops::Range;

    #[derive(Debug, Error)]
    #[error("never")]
    struct Never;

    /// Reports every page whose index is in `hits` as candidate.
    struct PageBuilder {
        hits: HashSet<usize>,
    }

    impl EvictionSetBuilder for PageBuilder {
        type Error = Never;

        fn name(&self) -> &'static str {
            "pages"
        }

        fn build_window(
            &mut self,
            _victim: *mut u8,
            pool: &Memory,
            window: Range<usize>,
        ) -> Result<EvictionSet, Never> {
            Ok(window
                .step_by(PAGE_SIZE)
                .filter(|off| self.hits.contains(&(off / PAGE_SIZE)))
                .map(|off| pool.addr(off))
                .collect())
        }
    }

    struct CountOracle {
        congruent: HashSet<usize>,
        w: usize,
    }

    impl EvictionOracle for CountOracle {
        fn evicts(&self, set: &EvictionSet, _victim: *mut u8) -> bool {
            set.iter()
                .filter(|&a| self.congruent.contains(&(a as usize)))
                .count()
                >= self.w
        }
    }

    const BASE: usize = 0x4000_0000;

    fn sieve(hits: &[usize], congruent: &[usize], w: usize) -> Sieve<'static, Never, CountOracle> {
        let config = EvsetConfig {
            associativity: w,
            ..Default::default()
        };
        Sieve::new(
            Box::new(PageBuilder {
                hits: hits.iter().copied().collect(),
            }),
            CountOracle {
                congruent: congruent.iter().map(|p| BASE + p * PAGE_SIZE).collect(),
                w,
            },
            config,
        )
    }

    #[test]
    fn test_run_reduces() -> anyhow::Result<()> {
        let pool = Memory::new(BASE as *mut u8, 64 * PAGE_SIZE);
        let mut s = sieve(&[1, 5, 9, 20, 33, 40], &[5, 20, 40], 3);
        let report = s.run(0x1000 as *mut u8, &pool)?;
        assert_eq!(report.candidates, 6);
        assert_eq!(report.eviction_set.len(), 3);
        assert_eq!(report.reduction.discarded, 3);
        Ok(())
    }

    #[test]
    fn test_run_not_evicting() {
        let pool = Memory::new(BASE as *mut u8, 64 * PAGE_SIZE);
        let mut s = sieve(&[1, 5], &[5, 20, 40], 3);
        assert!(matches!(
            s.run(0x1000 as *mut u8, &pool),
            Err(SieveError::NotEvicting { len: 2 })
        ));
    }

    #[test]
    fn test_incremental_stops_at_first_functional_window() -> anyhow::Result<()> {
        let pool = Memory::new(BASE as *mut u8, 64 * PAGE_SIZE);
        let mut s = sieve(&[1, 5, 9, 20, 33, 40, 50, 60], &[5, 20, 40], 3);
        let report = s.run_incremental(0x1000 as *mut u8, &pool, 10 * PAGE_SIZE)?;
        // pages 1..=40 are merged when the fifth window completes
        assert_eq!(report.candidates, 6);
        assert_eq!(report.eviction_set.len(), 3);
        Ok(())
    }
}
