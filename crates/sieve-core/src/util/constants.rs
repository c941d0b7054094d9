/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Cache line size (64 bytes) for x86_64
pub const CL_SIZE: usize = 64;
/// Bits of a virtual address that select the cache line within a page.
///
/// These bits are identical in the virtual and the physical address, so two
/// addresses can only share a cache set if they agree on them.
pub const CL_SET_MASK: usize = PAGE_MASK & !(CL_SIZE - 1);

/// Stride between candidate pairs during eviction set construction (two pages)
pub const PAIR_STRIDE: usize = 2 * PAGE_SIZE;

/// Default LLC associativity when the geometry cannot be detected
pub const CACHE_ASSOC: usize = 16;
/// Default cycle threshold above which an access counts as a cache miss
pub const CACHE_MISS_THRESHOLD: u64 = 130;

/// Number of rounds for timer calibration
pub const CALIBRATION_ROUNDS: usize = 1_000_000;
