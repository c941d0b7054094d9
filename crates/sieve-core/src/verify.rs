//! Physical confirmation of timing-based collisions.
//!
//! Only used for diagnostics: the eviction set algorithms never depend on it.

use log::{info, warn};
use serde::Serialize;

use crate::evset::EvictionSet;
use crate::geometry::{CacheGeometry, CacheLocation};
use crate::memory::{PhysAddr, VirtToPhysResolver};

/// Outcome of comparing a candidate with the victim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Same set and same slice
    Congruent,
    /// Same set, different slice
    SameSet,
    /// Different set
    Mismatch,
    /// Physical address could not be resolved
    Unavailable,
}

/// Running tally of verdicts.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct VerifyStats {
    /// Candidates in the victim's set and slice
    pub congruent: usize,
    /// Candidates in the victim's set but another slice
    pub same_set: usize,
    /// Candidates in another set
    pub false_positives: usize,
    /// Candidates that could not be resolved
    pub unresolved: usize,
}

impl VerifyStats {
    /// Adds a verdict.
    pub fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Congruent => self.congruent += 1,
            Verdict::SameSet => self.same_set += 1,
            Verdict::Mismatch => self.false_positives += 1,
            Verdict::Unavailable => self.unresolved += 1,
        }
    }

    /// Candidates whose set matches the victim's.
    pub fn matches(&self) -> usize {
        self.congruent + self.same_set
    }

    /// Verdicts recorded after `earlier` was taken.
    pub fn since(&self, earlier: &VerifyStats) -> VerifyStats {
        VerifyStats {
            congruent: self.congruent.saturating_sub(earlier.congruent),
            same_set: self.same_set.saturating_sub(earlier.same_set),
            false_positives: self.false_positives.saturating_sub(earlier.false_positives),
            unresolved: self.unresolved.saturating_sub(earlier.unresolved),
        }
    }
}

/// Compares a candidate address with the victim.
pub trait CollisionCheck {
    /// Classifies `candidate` relative to `victim`.
    fn check(&mut self, victim: *const u8, candidate: *const u8) -> Verdict;

    /// Logs the physical location of every address of `set`.
    fn describe(&mut self, set: &EvictionSet, victim: *const u8);
}

/// [`CollisionCheck`] based on a physical address resolver and the cache geometry.
pub struct PhysicalVerifier<R: VirtToPhysResolver> {
    resolver: R,
    geometry: CacheGeometry,
}

impl<R: VirtToPhysResolver> PhysicalVerifier<R> {
    /// Creates a verifier.
    pub fn new(resolver: R, geometry: CacheGeometry) -> Self {
        PhysicalVerifier { resolver, geometry }
    }

    /// Physical address and cache location of `virt`.
    ///
    /// # Errors
    ///
    /// Returns the resolver error if translation fails.
    pub fn locate(&mut self, virt: *const u8) -> Result<(PhysAddr, CacheLocation), R::Error> {
        let paddr = self.resolver.get_phys(virt as u64)?;
        Ok((paddr, self.geometry.locate(paddr)))
    }
}

impl<R: VirtToPhysResolver> CollisionCheck for PhysicalVerifier<R> {
    fn check(&mut self, victim: *const u8, candidate: *const u8) -> Verdict {
        let (v, c) = match (self.locate(victim), self.locate(candidate)) {
            (Ok((_, v)), Ok((_, c))) => (v, c),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Physical confirmation unavailable: {}", e);
                return Verdict::Unavailable;
            }
        };
        match (v.set == c.set, v.slice == c.slice) {
            (true, true) => Verdict::Congruent,
            (true, false) => Verdict::SameSet,
            _ => Verdict::Mismatch,
        }
    }

    fn describe(&mut self, set: &EvictionSet, victim: *const u8) {
        match self.locate(victim) {
            Ok((paddr, loc)) => info!(
                "Victim: {:p}\t Cache Set: {:4}, Cache Slice: {}",
                paddr, loc.set, loc.slice
            ),
            Err(e) => warn!("Victim {:p} unresolved: {}", victim, e),
        }
        for (i, addr) in set.iter().enumerate() {
            match self.locate(addr) {
                Ok((paddr, loc)) => info!(
                    "    {:2}: {:p}\t Cache Set: {:4}, Cache Slice: {}",
                    i, paddr, loc.set, loc.slice
                ),
                Err(e) => warn!("    {:2}: {:p} unresolved: {}", i, addr, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vendor;
    use pagemap2::VirtualMemoryArea;

    /// Identity mapping, fails for addresses below 0x1000.
    struct IdentityResolver;

    #[derive(Debug, thiserror::Error)]
    #[error("unmapped")]
    struct Unmapped;

    impl VirtToPhysResolver for IdentityResolver {
        type Error = Unmapped;

        fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error> {
            if virt < 0x1000 {
                return Err(Unmapped);
            }
            Ok(PhysAddr::new(virt as usize))
        }

        fn get_phys_range(&mut self, _: VirtualMemoryArea) -> Result<Vec<PhysAddr>, Self::Error> {
            Err(Unmapped)
        }
    }

    fn verifier() -> PhysicalVerifier<IdentityResolver> {
        PhysicalVerifier::new(
            IdentityResolver,
            CacheGeometry {
                vendor: Vendor::Intel,
                level: 3,
                line_size: 64,
                sets: 2048,
                ways: 16,
                partitions: 1,
                slices: 1,
                size: 2 << 20,
            },
        )
    }

    #[test]
    fn test_verdicts() {
        let mut v = verifier();
        let victim = 0x10_0040 as *const u8;
        // 2048 sets of 64 B repeat every 128 KB
        assert_eq!(v.check(victim, 0x12_0040 as *const u8), Verdict::Congruent);
        assert_eq!(v.check(victim, 0x12_0080 as *const u8), Verdict::Mismatch);
        assert_eq!(v.check(victim, 0x40 as *const u8), Verdict::Unavailable);
    }

    #[test]
    fn test_stats() {
        let mut stats = VerifyStats::default();
        for verdict in [
            Verdict::Congruent,
            Verdict::SameSet,
            Verdict::Mismatch,
            Verdict::Unavailable,
            Verdict::Congruent,
        ] {
            stats.record(verdict);
        }
        assert_eq!(stats.matches(), 3);
        assert_eq!(stats.false_positives, 1);
        assert_eq!(stats.unresolved, 1);

        let earlier = stats;
        stats.record(Verdict::Mismatch);
        let delta = stats.since(&earlier);
        assert_eq!(delta.false_positives, 1);
        assert_eq!(delta.matches(), 0);
    }
}
