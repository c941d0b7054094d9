//! Intel LLC slice hash functions.
//!
//! Each output bit of the slice index is the parity of a fixed subset of
//! physical address bits.

const H0: &[u32] = &[
    6, 10, 12, 14, 16, 17, 18, 20, 22, 24, 25, 26, 27, 28, 30, 32, 33, 35, 36,
];
const H1: &[u32] = &[
    7, 11, 13, 15, 17, 19, 20, 21, 22, 23, 24, 26, 28, 29, 31, 33, 34, 35, 37,
];
const H2: &[u32] = &[8, 12, 13, 16, 19, 22, 23, 26, 27, 30, 31, 34, 35, 36, 37];

fn parity(paddr: u64, bits: &[u32]) -> usize {
    bits.iter()
        .fold(0, |acc, &b| acc ^ ((paddr >> b) & 1) as usize)
}

/// Slice index of `paddr` for an LLC with `slices` slices.
///
/// Only 1, 2, 4 and 8 slices have known hash functions; any other slice
/// count maps everything to slice 0.
pub fn slice_of(paddr: u64, slices: usize) -> usize {
    match slices {
        2 => parity(paddr, H0),
        4 => parity(paddr, H0) | parity(paddr, H1) << 1,
        8 => parity(paddr, H0) | parity(paddr, H1) << 1 | parity(paddr, H2) << 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::slice_of;

    #[test]
    fn test_single_slice() {
        assert_eq!(slice_of(0xdead_beef, 1), 0);
        assert_eq!(slice_of(0xdead_beef, 6), 0);
    }

    #[test]
    fn test_two_slices() {
        assert_eq!(slice_of(0, 2), 0);
        // bit 6 is in h0
        assert_eq!(slice_of(1 << 6, 2), 1);
        // bits 6 and 10 cancel out
        assert_eq!(slice_of((1 << 6) | (1 << 10), 2), 0);
        // bit 7 is not in h0
        assert_eq!(slice_of(1 << 7, 2), 0);
    }

    #[test]
    fn test_eight_slices() {
        assert_eq!(slice_of(1 << 7, 8), 0b010);
        assert_eq!(slice_of(1 << 8, 8), 0b100);
        // bit 17 is in h0 and h1, bit 19 in h1 and h2
        assert_eq!(slice_of(1 << 17, 8), 0b011);
        assert_eq!(slice_of(1 << 19, 8), 0b110);
        assert!(slice_of(0x1234_5678_9a, 8) < 8);
    }

    #[test]
    fn test_page_offset_bits_matter() {
        // addresses of the same page can land in different slices
        let page = 0x7_4000_0000u64;
        let slices: std::collections::HashSet<usize> =
            (0..64).map(|line| slice_of(page + line * 64, 4)).collect();
        assert_eq!(slices.len(), 4);
    }
}
