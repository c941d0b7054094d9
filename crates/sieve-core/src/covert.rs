//! Flush+Reload covert channel over 256 page-aligned entries.

use rand::RngCore;

use crate::access::{access, flush_b};
use crate::memory::{BytePointer, Memory};
use crate::probe::CacheProbe;
use crate::util::{PAGE_SIZE, Rng};

/// Number of encodable values
pub const ENTRIES: usize = 256;
/// Distance between entries, one page to defeat the prefetcher
pub const ENTRY_OFFSET: usize = PAGE_SIZE;

/// Permutation of the entry order used to avoid prefetcher patterns.
#[inline(always)]
fn mix(i: usize) -> usize {
    ((i * 167) + 13) & 255
}

/// Sender and receiver of a one-byte cache covert channel.
pub struct CovertChannel<'a> {
    mem: Memory,
    probe: CacheProbe<'a>,
}

impl<'a> CovertChannel<'a> {
    /// Maps the channel memory and fills it with random bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the memory cannot be mapped.
    pub fn new(probe: CacheProbe<'a>, rng: &mut Rng) -> std::io::Result<Self> {
        let mem = Memory::mmap(ENTRIES * ENTRY_OFFSET, 0)?;
        let bytes = unsafe { std::slice::from_raw_parts_mut(mem.ptr(), mem.len()) };
        rng.fill_bytes(bytes);
        let channel = CovertChannel { mem, probe };
        channel.flush_all();
        Ok(channel)
    }

    fn entry(&self, value: usize) -> *mut u8 {
        self.mem.addr(value * ENTRY_OFFSET)
    }

    /// Flushes every entry.
    pub fn flush_all(&self) {
        for i in 0..ENTRIES {
            unsafe { flush_b(self.entry(i)) };
        }
    }

    /// Caches the entry of `value`.
    pub fn encode(&self, value: u8) {
        unsafe { access(self.entry(value as usize)) };
    }

    /// Reads the byte behind `ptr`, encodes it and returns it.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads.
    pub unsafe fn encode_dereference(&self, ptr: *const u8) -> u8 {
        let value = unsafe { std::ptr::read_volatile(ptr) };
        self.encode(value);
        value
    }

    /// Returns the first cached entry in `from..to`, flushing every probed entry.
    ///
    /// With `use_mix` the entries are probed in a permuted order.
    pub fn decode_from_to(&self, from: usize, to: usize, use_mix: bool) -> Option<u8> {
        (from..to.min(ENTRIES))
            .map(|i| if use_mix { mix(i) } else { i })
            .find(|&value| unsafe { self.probe.flush_reload(self.entry(value)) })
            .map(|value| value as u8)
    }

    /// Decodes over all entries.
    pub fn decode(&self) -> Option<u8> {
        self.decode_from_to(0, ENTRIES, true)
    }

    /// Decodes over all entries except 0, which is often cached by noise.
    pub fn decode_nonull(&self) -> Option<u8> {
        (0..ENTRIES)
            .map(mix)
            .filter(|&value| value != 0)
            .find(|&value| unsafe { self.probe.flush_reload(self.entry(value)) })
            .map(|value| value as u8)
    }

    /// Probes every entry `iterations` times after running `sender` and counts hits.
    pub fn histogram(&self, iterations: usize, mut sender: impl FnMut(&Self)) -> Vec<usize> {
        let mut hist = vec![0; ENTRIES];
        for _ in 0..iterations {
            sender(self);
            for i in 0..ENTRIES {
                let value = mix(i);
                if unsafe { self.probe.flush_reload(self.entry(value)) } {
                    hist[value] += 1;
                }
            }
        }
        hist
    }

    /// Unmaps the channel memory.
    pub fn dealloc(self) {
        self.mem.dealloc();
    }
}
