use std::hint::black_box;
use std::ops::Range;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, trace, warn};
use serde::Serialize;
use sieve_core::EvsetConfig;
use sieve_core::evset::{EvictionSet, EvictionSetBuilder};
use sieve_core::memory::{BytePointer, Memory};
use sieve_core::retry;
use sieve_core::util::{CL_SET_MASK, NamedProgress, PAGE_MASK, PAGE_SIZE, PAIR_STRIDE, mean};
use sieve_core::verify::{CollisionCheck, Verdict, VerifyStats};
use thiserror::Error;

use crate::probe::CollisionProbe;

/// Counters of all scans since construction.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ScanStats {
    /// Candidate pairs measured
    pub pairs: usize,
    /// Samples discarded above the outlier threshold
    pub outliers: usize,
    /// Pairs dropped because their means were too close
    pub ambiguous: usize,
    /// Candidates added to an eviction set
    pub accepted: usize,
    /// Physical confirmation of accepted candidates
    pub verify: VerifyStats,
}

impl ScanStats {
    /// Counters accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &ScanStats) -> ScanStats {
        ScanStats {
            pairs: self.pairs.saturating_sub(earlier.pairs),
            outliers: self.outliers.saturating_sub(earlier.outliers),
            ambiguous: self.ambiguous.saturating_sub(earlier.ambiguous),
            accepted: self.accepted.saturating_sub(earlier.accepted),
            verify: self.verify.since(&earlier.verify),
        }
    }
}

/// Errors of the write+write builder.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested window does not fit the pool
    #[error("Window {start:#x}..{end:#x} exceeds the pool of {len:#x} bytes")]
    WindowOutOfBounds {
        /// Window start offset
        start: usize,
        /// Window end offset
        end: usize,
        /// Pool length
        len: usize,
    },
    /// The victim pointer is null
    #[error("Victim address is null")]
    NullVictim,
}

#[derive(Debug, Error)]
#[error("outlier sample {0}")]
struct Outlier(u64);

/// Write+write eviction set builder.
///
/// Candidates share the victim's page offset bits (`victim & 0xFC0`) and
/// come in pairs one page apart. For each pair, `2 * runs` trials alternate
/// between both members, two trials at a time. The member whose mean write
/// time is larger by more than `significance` collides with the victim.
pub struct WriteWrite<P: CollisionProbe> {
    probe: P,
    config: EvsetConfig,
    progress: Option<MultiProgress>,
    verifier: Option<Box<dyn CollisionCheck>>,
    stats: ScanStats,
}

impl<P: CollisionProbe> WriteWrite<P> {
    /// Creates a builder measuring with `probe`.
    pub fn new(probe: P, config: EvsetConfig, progress: Option<MultiProgress>) -> Self {
        WriteWrite {
            probe,
            config,
            progress,
            verifier: None,
            stats: ScanStats::default(),
        }
    }

    /// Confirms every accepted candidate with `verifier`.
    pub fn with_verifier(mut self, verifier: Box<dyn CollisionCheck>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Counters accumulated over all scans.
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    /// Logs the physical location of `set` if a verifier is attached.
    pub fn describe(&mut self, set: &EvictionSet, victim: *const u8) {
        if let Some(verifier) = self.verifier.as_mut() {
            verifier.describe(set, victim);
        }
    }

    /// First candidate address at or after `from` sharing the victim's line offset.
    fn aligned_start(victim: *const u8, from: usize) -> usize {
        let set_bits = victim as usize & CL_SET_MASK;
        let start = (from & !PAGE_MASK) | set_bits;
        if start < from { start + PAGE_SIZE } else { start }
    }

    /// One plausible write time, outliers are resampled.
    fn sample(&mut self, victim: *mut u8, candidate: *mut u8) -> u64 {
        let outlier_threshold = self.config.outlier_threshold;
        let outliers = &mut self.stats.outliers;
        let probe = &self.probe;
        retry!(|| {
            let time = unsafe { probe.time_write_pair(victim, candidate) };
            if time > outlier_threshold {
                *outliers += 1;
                Err(Outlier(time))
            } else {
                Ok(time)
            }
        })
    }

    /// Mean write times of both members of a pair.
    ///
    /// `None` if a member received no trials, which happens for `runs < 2`.
    fn measure_pair(&mut self, victim: *mut u8, pair: [*mut u8; 2]) -> Option<[f64; 2]> {
        let runs = self.config.runs;
        let mut samples = [Vec::with_capacity(runs), Vec::with_capacity(runs)];
        let [c0, c1] = pair.map(|c| c as usize);
        for ctr in 0..2 * runs {
            let decision = (ctr & 2) >> 1;
            let mask = decision.wrapping_neg();
            let candidate = black_box((c0 & !mask) | (c1 & mask)) as *mut u8;
            let time = self.sample(victim, candidate);
            samples[decision].push(time);
        }
        Some([mean(&samples[0])?, mean(&samples[1])?])
    }

    fn confirm(&mut self, victim: *mut u8, candidate: *mut u8) {
        let Some(verifier) = self.verifier.as_mut() else {
            return;
        };
        let verdict = verifier.check(victim, candidate);
        match verdict {
            Verdict::Congruent => debug!("{:p}: same set and slice", candidate),
            Verdict::SameSet => debug!("{:p}: same set, different slice", candidate),
            Verdict::Mismatch => info!("{:p}: false positive, different set", candidate),
            Verdict::Unavailable => {
                warn!("{:p}: collision found, physical confirmation unavailable", candidate)
            }
        }
        self.stats.verify.record(verdict);
    }
}

impl<P: CollisionProbe> EvictionSetBuilder for WriteWrite<P> {
    type Error = Error;

    fn name(&self) -> &'static str {
        "write+write"
    }

    fn build_window(
        &mut self,
        victim: *mut u8,
        pool: &Memory,
        window: Range<usize>,
    ) -> Result<EvictionSet, Self::Error> {
        if victim.is_null() {
            return Err(Error::NullVictim);
        }
        if window.start > window.end || window.end > pool.len() {
            return Err(Error::WindowOutOfBounds {
                start: window.start,
                end: window.end,
                len: pool.len(),
            });
        }
        let base = pool.ptr() as usize;
        let start = Self::aligned_start(victim, base + window.start);
        let end = base + window.end;
        let pairs = (start..end)
            .step_by(PAIR_STRIDE)
            .filter(|&c0| c0 + PAGE_SIZE < end)
            .map(|c0| [c0 as *mut u8, (c0 + PAGE_SIZE) as *mut u8])
            .filter(|pair| !pair.contains(&victim))
            .collect_vec();
        debug!(
            "Scanning {} pairs in {:#x}..{:#x} for victim {:p}",
            pairs.len(),
            start,
            end,
            victim
        );

        let p = self.progress.as_ref().map(|p| {
            p.add(
                ProgressBar::new(pairs.len() as u64)
                    .with_style(ProgressStyle::named_bar("Scanning pairs")),
            )
        });
        let mut set = EvictionSet::new();
        for pair in pairs {
            let means = self.measure_pair(victim, pair);
            self.stats.pairs += 1;
            if let Some(p) = &p {
                p.inc(1);
            }
            let Some([mean0, mean1]) = means else {
                trace!("{:p}/{:p}: a member was never sampled", pair[0], pair[1]);
                self.stats.ambiguous += 1;
                continue;
            };
            if (mean0 - mean1).abs() <= self.config.significance as f64 {
                trace!(
                    "{:p}/{:p}: no significant difference ({:.1} vs {:.1})",
                    pair[0], pair[1], mean0, mean1
                );
                self.stats.ambiguous += 1;
                continue;
            }
            let candidate = if mean0 > mean1 { pair[0] } else { pair[1] };
            info!(
                "Collision at {:p} (means {:.1} / {:.1})",
                candidate, mean0, mean1
            );
            self.confirm(victim, candidate);
            self.stats.accepted += 1;
            set.push(candidate);
        }
        if let Some(p) = &p {
            p.finish_and_clear();
        }
        info!(
            "Found {} candidates, {} ambiguous pairs, {} outliers so far",
            set.len(),
            self.stats.ambiguous,
            self.stats.outliers
        );
        Ok(set)
    }
}
