use std::ptr::null_mut;

use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_PRIVATE};
use log::debug;

use super::BytePointer;
use crate::util::PAGE_SIZE;

/// A managed memory region.
///
/// The region is not unmapped on drop; call [`Memory::dealloc`].
#[derive(Clone, Debug)]
pub struct Memory {
    /// Block pointer
    pub ptr: *mut u8,
    /// Block length in bytes
    pub len: usize,
}

unsafe impl Send for Memory {}

impl Memory {
    /// Wraps an existing region.
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Memory { ptr, len }
    }

    /// Allocates memory using mmap.
    ///
    /// The region is private, anonymous and populated, then filled with
    /// `fill` so that every page is backed by its own physical frame.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap(size: usize, fill: u8) -> std::result::Result<Self, std::io::Error> {
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::memset(p, fill as libc::c_int, size) };
        debug!("Mapped {} bytes at {:p}", size, p);
        Ok(Memory::new(p as *mut u8, size))
    }

    /// Deallocates the memory block.
    ///
    /// Unmaps the memory region using munmap. Consumes self.
    pub fn dealloc(self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }

    /// Number of whole pages in this region.
    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }
}

impl BytePointer for Memory {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "Memory::addr failed. Offset {} >= {}",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }
    fn ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.len
    }
}
