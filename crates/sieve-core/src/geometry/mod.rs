//! Last-level cache geometry and physical-address to cache-set mapping.
//!
//! [`CacheGeometry::detect`] reads the LLC parameters from CPUID (Intel leaf
//! 4, AMD leaf 0x8000001D) and falls back to sysfs. Overrides from
//! [`SieveConfig`] are applied on top. The resulting geometry is immutable
//! and maps physical addresses to their cache set and slice.

pub mod cpuid;
mod slice;
mod sysfs;

pub use self::cpuid::Vendor;
pub use self::slice::slice_of;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::cpuid::{AMD_CACHE_LEAF, CacheType, INTEL_CACHE_LEAF};
use crate::config::SieveConfig;
use crate::memory::PhysAddr;
use crate::util::{log2, physical_cores};

/// Errors that can occur while determining the cache geometry.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// Reading sysfs failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Neither CPUID nor sysfs describe a data cache
    #[error("No cache description found")]
    NotFound,
    /// Detected or configured values are inconsistent
    #[error("Invalid cache geometry: {0}")]
    Invalid(String),
}

/// Parameters of the last-level cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    /// Vendor of the CPU, selects the slice hash
    pub vendor: Vendor,
    /// Cache level of the described cache
    pub level: u8,
    /// Line size in bytes
    pub line_size: usize,
    /// Number of sets over all slices
    pub sets: usize,
    /// Associativity
    pub ways: usize,
    /// Physical line partitions
    pub partitions: usize,
    /// Number of slices
    pub slices: usize,
    /// Capacity in bytes
    pub size: usize,
}

/// Cache set and slice of a physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CacheLocation {
    /// Set index within the slice
    pub set: usize,
    /// Slice index
    pub slice: usize,
}

impl CacheGeometry {
    /// Detects the LLC geometry and applies configured overrides.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError`] if no source describes the cache or the
    /// result is inconsistent.
    pub fn detect(config: &SieveConfig) -> Result<Self, GeometryError> {
        let geometry = match Self::from_cpuid() {
            Some(g) => g,
            None => {
                warn!("CPUID does not describe the LLC, falling back to sysfs");
                let vendor = cpuid::vendor();
                sysfs::detect(vendor, default_slices(vendor))?
            }
        };
        let geometry = geometry.with_overrides(config);
        geometry.validate()?;
        info!(
            "LLC: L{} {} KB, {} sets, {} ways, {} slices, {} B lines",
            geometry.level,
            geometry.size >> 10,
            geometry.sets,
            geometry.ways,
            geometry.slices,
            geometry.line_size
        );
        Ok(geometry)
    }

    /// Reads the highest data or unified cache level from CPUID.
    pub fn from_cpuid() -> Option<Self> {
        let vendor = cpuid::vendor();
        let leaf = match vendor {
            Vendor::Intel => INTEL_CACHE_LEAF,
            Vendor::Amd => AMD_CACHE_LEAF,
            Vendor::Other => return None,
        };
        let llc = cpuid::cache_levels(leaf)
            .into_iter()
            .filter(|l| l.cache_type != CacheType::Instruction)
            .max_by_key(|l| l.level)?;
        Some(CacheGeometry {
            vendor,
            level: llc.level,
            line_size: llc.line_size,
            sets: llc.sets,
            ways: llc.ways,
            partitions: llc.partitions,
            slices: default_slices(vendor),
            size: llc.size(),
        })
    }

    /// Replaces detected values with configured ones.
    pub fn with_overrides(mut self, config: &SieveConfig) -> Self {
        if let Some(slices) = config.llc_slices {
            self.slices = slices;
        }
        if let Some(line_size) = config.llc_line_size {
            self.line_size = line_size;
        }
        if let Some(partitions) = config.llc_partitions {
            self.partitions = partitions;
        }
        if let Some(sets) = config.llc_sets {
            self.sets = sets;
        }
        if self.sets == 0 && self.line_size * self.ways * self.partitions > 0 {
            self.sets = self.size / self.line_size / self.ways / self.partitions;
        }
        self
    }

    fn validate(&self) -> Result<(), GeometryError> {
        if !self.line_size.is_power_of_two() {
            return Err(GeometryError::Invalid(format!(
                "line size {} is not a power of two",
                self.line_size
            )));
        }
        if self.sets == 0 || self.ways == 0 || self.slices == 0 {
            return Err(GeometryError::Invalid(format!("{:?}", self)));
        }
        Ok(())
    }

    /// Sets per slice.
    pub fn sets_per_slice(&self) -> usize {
        self.sets / self.slices.max(1)
    }

    /// Mask selecting the set index bits of a physical address.
    pub fn set_mask(&self) -> u64 {
        ((1u64 << log2(self.sets_per_slice())) - 1) << log2(self.line_size)
    }

    /// Cache set of a physical address.
    pub fn cache_set(&self, paddr: PhysAddr) -> usize {
        ((paddr.as_usize() as u64 & self.set_mask()) >> log2(self.line_size)) as usize
    }

    /// Cache slice of a physical address.
    ///
    /// The slice hash is only known for Intel, other vendors report slice 0.
    pub fn cache_slice(&self, paddr: PhysAddr) -> usize {
        match self.vendor {
            Vendor::Intel => slice_of(paddr.as_usize() as u64, self.slices),
            Vendor::Amd | Vendor::Other => 0,
        }
    }

    /// Cache set and slice of a physical address.
    pub fn locate(&self, paddr: PhysAddr) -> CacheLocation {
        CacheLocation {
            set: self.cache_set(paddr),
            slice: self.cache_slice(paddr),
        }
    }
}

/// Slices are one per physical core, two per core from Skylake on.
fn default_slices(vendor: Vendor) -> usize {
    let cores = physical_cores();
    if vendor == Vendor::Intel && cpuid::max_basic_leaf() >= 0x16 {
        cores * 2
    } else {
        cores
    }
}
