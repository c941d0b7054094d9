//! Physical-address eviction set builder.
//!
//! Resolves the physical address of every page in the pool through a
//! [`VirtToPhysResolver`] and keeps the addresses that map to the victim's
//! cache set and slice. Serves as ground truth for the timing builders.
//!
//! Implements the [`sieve_core::evset::EvictionSetBuilder`] trait.
//!
//! With [`sieve_core::memory::LinuxPageMap`] this requires root privileges.

#![warn(missing_docs)]

use std::ops::Range;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info};
use pagemap2::VirtualMemoryArea;
use sieve_core::evset::{EvictionSet, EvictionSetBuilder};
use sieve_core::geometry::{CacheGeometry, CacheLocation};
use sieve_core::memory::{BytePointer, LinuxPageMap, LinuxPageMapError, Memory, VirtToPhysResolver};
use sieve_core::util::{NamedProgress, PAGE_MASK, PAGE_SIZE};
use thiserror::Error;

/// Errors of the pagemap builder.
#[derive(Debug, Error)]
pub enum Error<E: std::error::Error> {
    /// Address translation failed
    #[error("Physical address translation failed: {0}")]
    Resolver(E),
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
}

/// Builder selecting congruent addresses by their physical address.
pub struct PageMapBuilder<R: VirtToPhysResolver> {
    resolver: R,
    geometry: CacheGeometry,
    progress: Option<MultiProgress>,
}

impl PageMapBuilder<LinuxPageMap> {
    /// Creates a builder on `/proc/self/pagemap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pagemap cannot be opened.
    pub fn linux(
        geometry: CacheGeometry,
        progress: Option<MultiProgress>,
    ) -> Result<Self, LinuxPageMapError> {
        Ok(Self::new(LinuxPageMap::new()?, geometry, progress))
    }
}

impl<R: VirtToPhysResolver> PageMapBuilder<R> {
    /// Creates a builder translating with `resolver`.
    pub fn new(resolver: R, geometry: CacheGeometry, progress: Option<MultiProgress>) -> Self {
        PageMapBuilder {
            resolver,
            geometry,
            progress,
        }
    }

    /// Cache location of `virt`.
    ///
    /// # Errors
    ///
    /// Returns the resolver error if translation fails.
    pub fn locate(&mut self, virt: *const u8) -> Result<CacheLocation, R::Error> {
        let paddr = self.resolver.get_phys(virt as u64)?;
        Ok(self.geometry.locate(paddr))
    }
}

impl<R: VirtToPhysResolver> EvictionSetBuilder for PageMapBuilder<R> {
    type Error = Error<R::Error>;

    fn name(&self) -> &'static str {
        "pagemap"
    }

    fn build_window(
        &mut self,
        victim: *mut u8,
        pool: &Memory,
        window: Range<usize>,
    ) -> Result<EvictionSet, Self::Error> {
        if window.start > window.end || window.end > pool.len() {
            return Err(Error::WindowOutOfBounds {
                start: window.start,
                end: window.end,
                len: pool.len(),
            });
        }
        let target = self.locate(victim).map_err(Error::Resolver)?;
        debug!("Victim {:p} in {:?}", victim, target);

        // whole pages only, the victim's offset is applied to each
        let offset = victim as usize & PAGE_MASK;
        let first_page = window.start.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let last_page = window.end / PAGE_SIZE * PAGE_SIZE;
        if first_page >= last_page {
            return Ok(EvictionSet::new());
        }
        // `last_page` may equal the pool length, the end is exclusive
        let base = pool.ptr() as u64;
        let (start, end) = (base + first_page as u64, base + last_page as u64);
        let frames = self
            .resolver
            .get_phys_range(VirtualMemoryArea::from((start, end)))
            .map_err(Error::Resolver)?;

        let p = self.progress.as_ref().map(|p| {
            p.add(
                ProgressBar::new(frames.len() as u64)
                    .with_style(ProgressStyle::named_bar("Resolving pages")),
            )
        });
        let mut set = EvictionSet::new();
        for (page, frame) in frames.into_iter().enumerate() {
            if let Some(p) = &p {
                p.inc(1);
            }
            if frame.as_usize() == 0 {
                continue;
            }
            let candidate = pool.addr(first_page + page * PAGE_SIZE + offset);
            if candidate == victim {
                continue;
            }
            if self.geometry.locate(frame + offset) == target {
                set.push(candidate);
            }
        }
        if let Some(p) = &p {
            p.finish_and_clear();
        }
        info!(
            "Found {} congruent addresses in {} pages",
            set.len(),
            (last_page - first_page) / PAGE_SIZE
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::geometry::Vendor;
    use sieve_core::memory::PhysAddr;

    const BASE: usize = 0x3000_0000;

    /// Maps virtual page `i` of the pool to physical frame `i`.
    struct LinearResolver;

    #[derive(Debug, Error)]
    #[error("unmapped 0x{0:x}")]
    struct Unmapped(u64);

    impl VirtToPhysResolver for LinearResolver {
        type Error = Unmapped;

        fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error> {
            if (virt as usize) < BASE {
                return Err(Unmapped(virt));
            }
            Ok(PhysAddr::new(virt as usize - BASE))
        }

        fn get_phys_range(
            &mut self,
            region: VirtualMemoryArea,
        ) -> Result<Vec<PhysAddr>, Self::Error> {
            let (start, end) = (region.start_address(), region.last_address());
            Ok((start..end)
                .step_by(PAGE_SIZE)
                .map(|v| PhysAddr::new(v as usize - BASE))
                .collect())
        }
    }

    fn geometry() -> CacheGeometry {
        CacheGeometry {
            vendor: Vendor::Intel,
            level: 3,
            line_size: 64,
            sets: 1024,
            ways: 16,
            partitions: 1,
            slices: 1,
            size: 1 << 20,
        }
    }

    #[test]
    fn test_congruent_pages() -> Result<(), Error<Unmapped>> {
        // 1024 sets of 64 B repeat every 64 KB = 16 pages
        let pool = Memory::new(BASE as *mut u8, 64 * PAGE_SIZE);
        let victim = pool.addr(2 * PAGE_SIZE + 0x80);
        let mut builder = PageMapBuilder::new(LinearResolver, geometry(), None);
        let set = builder.build(victim, &pool)?;
        let expected: Vec<*mut u8> = [18, 34, 50]
            .iter()
            .map(|page| pool.addr(page * PAGE_SIZE + 0x80))
            .collect();
        assert_eq!(set.as_slice(), expected.as_slice());
        Ok(())
    }

    #[test]
    fn test_windows_ending_at_pool_end() -> Result<(), Error<Unmapped>> {
        let pool = Memory::new(BASE as *mut u8, 64 * PAGE_SIZE);
        let victim = pool.addr(2 * PAGE_SIZE + 0x80);
        let mut builder = PageMapBuilder::new(LinearResolver, geometry(), None);
        let tail = builder.build_window(victim, &pool, 40 * PAGE_SIZE..pool.len())?;
        assert_eq!(tail.as_slice(), &[pool.addr(50 * PAGE_SIZE + 0x80)]);
        // page 50 only partly lies in the window and is skipped
        let partial = builder.build_window(victim, &pool, 40 * PAGE_SIZE..50 * PAGE_SIZE + 0x100)?;
        assert!(partial.is_empty());
        Ok(())
    }

    #[test]
    fn test_unresolvable_victim() {
        let pool = Memory::new(BASE as *mut u8, 16 * PAGE_SIZE);
        let mut builder = PageMapBuilder::new(LinearResolver, geometry(), None);
        assert!(matches!(
            builder.build(0x1000 as *mut u8, &pool),
            Err(Error::Resolver(Unmapped(0x1000)))
        ));
    }
}
