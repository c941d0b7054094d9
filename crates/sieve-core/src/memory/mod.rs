//! Memory regions and virtual to physical address translation.
//!
//! - [`Memory`]: an mmap'd region, used as candidate pool and probe buffer.
//! - [`BytePointer`]: byte-level addressing of a region.
//! - [`VirtToPhysResolver`]: resolves physical addresses, implemented by
//!   [`LinuxPageMap`] on top of `/proc/self/pagemap`.
mod memblock;
mod virt_to_phys;

pub use self::memblock::Memory;
pub use self::virt_to_phys::{
    LinuxPageMap, LinuxPageMapError, PhysAddr, VirtToPhysResolver, direct_physical_map,
    phys_to_kernel_virt,
};

/// Trait for accessing memory as a byte pointer.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// The returned pointer is valid only while the memory region exists.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns a mutable pointer to the start of the memory region.
    fn ptr(&self) -> *mut u8;

    /// Returns the total length of the memory region in bytes.
    fn len(&self) -> usize;

    /// `true` if `addr` lies inside the region.
    fn contains(&self, addr: *const u8) -> bool {
        let start = self.ptr() as usize;
        (start..start + self.len()).contains(&(addr as usize))
    }
}
