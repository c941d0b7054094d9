use std::fmt::{Debug, Formatter};
use std::ops::Add;

use itertools::Itertools;
use log::{debug, warn};
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::Serialize;
use thiserror::Error;

use crate::config::SieveConfig;
use crate::util::{PAGE_MASK, PAGE_SHIFT, kernel_version};

#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Physical memory address.
pub struct PhysAddr(usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a usize.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Trait for resolving virtual addresses to physical addresses.
pub trait VirtToPhysResolver {
    /// Errors that can occur during physical address resolution
    type Error: std::error::Error;

    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if address translation fails.
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error>;

    /// Translates a range of virtual addresses to the physical addresses of
    /// its pages.
    ///
    /// # Errors
    ///
    /// Returns an error if address translation fails.
    fn get_phys_range(&mut self, region: VirtualMemoryArea) -> Result<Vec<PhysAddr>, Self::Error>;
}

/// Errors that can happen during PageMap operations
#[derive(Debug, Error)]
pub enum LinuxPageMapError {
    /// The pagemap interface failed
    #[error(transparent)]
    PageMap(#[from] PageMapError),
    /// The kernel reported no frame, usually because we are not root
    #[error("No physical frame for virtual address 0x{0:x}. Are we root?")]
    NoFrame(u64),
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Uses `/proc/{pid}/pagemap` to translate virtual to physical addresses.
/// Requires root privileges, otherwise the kernel reports PFN 0.
pub struct LinuxPageMap {
    pagemap_wrapper: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Creates a new pagemap for the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, LinuxPageMapError> {
        Self::for_process(std::process::id())
    }

    /// Creates a new pagemap for a specific process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening the process pagemap fails.
    pub fn for_process(pid: u32) -> Result<LinuxPageMap, LinuxPageMapError> {
        let res = LinuxPageMap {
            pagemap_wrapper: pagemap2::PageMap::new(pid as u64)?,
        };
        Ok(res)
    }
}

impl VirtToPhysResolver for LinuxPageMap {
    type Error = LinuxPageMapError;
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error> {
        let vaddr_start_page = virt & !(PAGE_MASK as u64);
        let vaddr_end_page = vaddr_start_page + PAGE_MASK as u64;

        let memory_region = VirtualMemoryArea::from((vaddr_start_page, vaddr_end_page));
        let entry = self.pagemap_wrapper.pagemap_vma(&memory_region)?;
        let pfn = match entry.first() {
            Some(e) => e.pfn()?,
            None => return Err(LinuxPageMapError::NoFrame(virt)),
        };
        if pfn == 0 {
            warn!(
                "Got invalid PFN 0 for virtual address 0x{:x}. Are we root?",
                virt
            );
            return Err(LinuxPageMapError::NoFrame(virt));
        }

        let phys_addr = ((pfn << PAGE_SHIFT) | (virt & PAGE_MASK as u64)) as usize;

        Ok(PhysAddr(phys_addr))
    }
    fn get_phys_range(
        &mut self,
        memory_region: VirtualMemoryArea,
    ) -> Result<Vec<PhysAddr>, Self::Error> {
        let entry = self.pagemap_wrapper.pagemap_vma(&memory_region)?;
        let pfns = entry
            .into_iter()
            .map(|e| e.pfn())
            .collect::<Result<Vec<u64>, PageMapError>>()?;
        if pfns.iter().all(|&p| p == 0) {
            warn!("All PFNs are 0. Are we root?");
        }
        Ok(pfns
            .into_iter()
            .map(|p| PhysAddr((p << PAGE_SHIFT) as usize))
            .collect_vec())
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

impl std::fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 + rhs)
    }
}

const DIRECT_MAP_PRE_4_19: u64 = 0xffff_8800_0000_0000;
const DIRECT_MAP: u64 = 0xffff_8880_0000_0000;

/// Base of the kernel's direct physical map.
///
/// A configured value wins. Otherwise the base depends on the kernel
/// version: it moved with Linux 4.19.
pub fn direct_physical_map(config: &SieveConfig) -> u64 {
    if let Some(base) = config.direct_physical_map {
        return base;
    }
    let base = direct_map_for(kernel_version());
    debug!("Direct physical map at 0x{:x}", base);
    base
}

fn direct_map_for(version: Option<(u32, u32)>) -> u64 {
    match version {
        Some(v) if v < (4, 19) => DIRECT_MAP_PRE_4_19,
        _ => DIRECT_MAP,
    }
}

/// Kernel virtual address of a physical address in the direct map.
pub fn phys_to_kernel_virt(paddr: PhysAddr, config: &SieveConfig) -> u64 {
    direct_physical_map(config) + paddr.as_usize() as u64
}
