//! CPUID queries used by the timers and the geometry detection.

use std::arch::x86_64::{__cpuid, __cpuid_count, CpuidResult};

use serde::{Deserialize, Serialize};

/// Leaf of the Intel deterministic cache parameters
pub const INTEL_CACHE_LEAF: u32 = 0x4;
/// Leaf of the AMD cache topology information
pub const AMD_CACHE_LEAF: u32 = 0x8000_001D;
const EXT_FEATURES_LEAF: u32 = 0x8000_0001;
const EXT_POWER_LEAF: u32 = 0x8000_0007;

/// CPU vendor as reported by leaf 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vendor {
    /// `GenuineIntel`
    Intel,
    /// `AuthenticAMD` or `HygonGenuine`
    Amd,
    /// Anything else
    Other,
}

/// Executes `cpuid` with the given leaf and subleaf.
#[inline]
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    unsafe { __cpuid_count(leaf, subleaf) }
}

/// Highest supported basic leaf.
pub fn max_basic_leaf() -> u32 {
    unsafe { __cpuid(0) }.eax
}

/// Highest supported extended leaf.
pub fn max_extended_leaf() -> u32 {
    unsafe { __cpuid(0x8000_0000) }.eax
}

/// Vendor of the executing CPU.
pub fn vendor() -> Vendor {
    let r = unsafe { __cpuid(0) };
    let mut id = [0u8; 12];
    id[0..4].copy_from_slice(&r.ebx.to_le_bytes());
    id[4..8].copy_from_slice(&r.edx.to_le_bytes());
    id[8..12].copy_from_slice(&r.ecx.to_le_bytes());
    match &id {
        b"GenuineIntel" => Vendor::Intel,
        b"AuthenticAMD" | b"HygonGenuine" => Vendor::Amd,
        _ => Vendor::Other,
    }
}

/// `true` if the CPU has a time stamp counter (leaf 1, EDX bit 4).
pub fn has_tsc() -> bool {
    max_basic_leaf() >= 1 && (cpuid(1, 0).edx >> 4) & 1 == 1
}

/// `true` if `rdtscp` is supported (leaf 0x80000001, EDX bit 27).
pub fn has_rdtscp() -> bool {
    max_extended_leaf() >= EXT_FEATURES_LEAF && (cpuid(EXT_FEATURES_LEAF, 0).edx >> 27) & 1 == 1
}

/// `true` if the TSC ticks at a constant rate (leaf 0x80000007, EDX bit 8).
pub fn has_invariant_tsc() -> bool {
    max_extended_leaf() >= EXT_POWER_LEAF && (cpuid(EXT_POWER_LEAF, 0).edx >> 8) & 1 == 1
}

/// Cache type field of a deterministic cache parameter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// Data cache
    Data,
    /// Instruction cache
    Instruction,
    /// Unified cache
    Unified,
}

/// One level of cache as described by leaf 4 (or 0x8000001D on AMD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLevel {
    /// Data, instruction or unified
    pub cache_type: CacheType,
    /// Cache level, starting at 1
    pub level: u8,
    /// Line size in bytes
    pub line_size: usize,
    /// Physical line partitions
    pub partitions: usize,
    /// Ways of associativity
    pub ways: usize,
    /// Number of sets
    pub sets: usize,
}

impl CacheLevel {
    /// Decodes a cache parameter leaf. Returns `None` for the terminating null entry.
    pub fn from_cpuid_result(cr: &CpuidResult) -> Option<CacheLevel> {
        let cache_type = match cr.eax & 0x1f {
            1 => CacheType::Data,
            2 => CacheType::Instruction,
            3 => CacheType::Unified,
            _ => return None,
        };
        Some(CacheLevel {
            cache_type,
            level: ((cr.eax >> 5) & 0x7) as u8,
            line_size: (cr.ebx & 0xfff) as usize + 1,
            partitions: ((cr.ebx >> 12) & 0x3ff) as usize + 1,
            ways: ((cr.ebx >> 22) & 0x3ff) as usize + 1,
            sets: cr.ecx as usize + 1,
        })
    }

    /// Total capacity in bytes.
    pub fn size(&self) -> usize {
        self.line_size * self.partitions * self.ways * self.sets
    }
}

/// Enumerates all cache levels of a deterministic cache parameter leaf.
pub fn cache_levels(leaf: u32) -> Vec<CacheLevel> {
    let max = if leaf & 0x8000_0000 != 0 {
        max_extended_leaf()
    } else {
        max_basic_leaf()
    };
    if max < leaf {
        return vec![];
    }
    (0..)
        .map(|i| CacheLevel::from_cpuid_result(&cpuid(leaf, i)))
        .take_while(Option::is_some)
        .flatten()
        .collect()
}
