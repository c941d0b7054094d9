//! Memory access primitives.
//!
//! The `_b` variants are surrounded by `mfence` and must be used whenever the
//! operation sits next to a timestamp, otherwise it may execute outside the
//! measured window.

use std::arch::x86_64::{__cpuid, _mm_clflush, _mm_lfence, _mm_mfence};

/// Reads one byte from `addr` to bring its line into the cache.
///
/// # Safety
///
/// `addr` must be valid for reads.
#[inline(always)]
pub unsafe fn access(addr: *const u8) {
    unsafe { std::ptr::read_volatile(addr) };
}

/// [`access`] between two memory fences.
///
/// # Safety
///
/// `addr` must be valid for reads.
#[inline(always)]
pub unsafe fn access_b(addr: *const u8) {
    unsafe {
        _mm_mfence();
        access(addr);
        _mm_mfence();
    }
}

/// Writes one byte to `addr`.
///
/// # Safety
///
/// `addr` must be valid for writes.
#[inline(always)]
pub unsafe fn write(addr: *mut u8, value: u8) {
    unsafe { std::ptr::write_volatile(addr, value) };
}

/// Evicts the line containing `addr` from all cache levels.
///
/// # Safety
///
/// `addr` must be mapped.
#[inline(always)]
pub unsafe fn flush(addr: *const u8) {
    unsafe { _mm_clflush(addr) };
}

/// [`flush`] between two memory fences.
///
/// # Safety
///
/// `addr` must be mapped.
#[inline(always)]
pub unsafe fn flush_b(addr: *const u8) {
    unsafe {
        _mm_mfence();
        _mm_clflush(addr);
        _mm_mfence();
    }
}

/// Full memory fence.
#[inline(always)]
pub fn mfence() {
    unsafe { _mm_mfence() };
}

/// Load fence.
#[inline(always)]
pub fn lfence() {
    unsafe { _mm_lfence() };
}

/// Serializes the instruction stream with `mfence; cpuid`.
#[inline(always)]
pub fn serialize() {
    unsafe {
        _mm_mfence();
        __cpuid(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_and_flush_valid_memory() {
        let mut buf = [7u8; 64];
        unsafe {
            access_b(buf.as_ptr());
            write(buf.as_mut_ptr(), 9);
            flush_b(buf.as_ptr());
            access(buf.as_ptr());
        }
        serialize();
        assert_eq!(buf[0], 9);
    }
}
