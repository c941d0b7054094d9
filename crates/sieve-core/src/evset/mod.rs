//! Eviction sets and the traits to build, test and reduce them.
//!
//! An [`EvictionSet`] is an ordered list of addresses inside a caller-owned
//! pool. Builders ([`EvictionSetBuilder`]) produce oversized sets,
//! [`EvictionTester`] decides whether a set evicts a victim and [`reduce`]
//! shrinks a functional set to the cache associativity.

mod reduce;
mod tester;

pub use self::reduce::{ReductionError, ReductionStats, reduce};
pub use self::tester::{EvictionOracle, EvictionProbe, EvictionTester, TimedEvictionProbe};

use std::fmt;
use std::ops::Range;

use serde::{Serialize, Serializer};

use crate::memory::{BytePointer, Memory};

/// Ordered collection of addresses believed to share the victim's cache set.
///
/// The addresses are borrowed from a pool; the set does not own the memory
/// behind them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionSet {
    addrs: Vec<*mut u8>,
}

unsafe impl Send for EvictionSet {}

impl EvictionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty set with room for `capacity` addresses.
    pub fn with_capacity(capacity: usize) -> Self {
        EvictionSet {
            addrs: Vec::with_capacity(capacity),
        }
    }

    /// Appends an address.
    pub fn push(&mut self, addr: *mut u8) {
        self.addrs.push(addr);
    }

    /// Removes and returns the address at `index`, shifting the tail.
    pub fn remove(&mut self, index: usize) -> *mut u8 {
        self.addrs.remove(index)
    }

    /// Removes and returns the first address.
    pub fn pop_front(&mut self) -> Option<*mut u8> {
        (!self.addrs.is_empty()).then(|| self.addrs.remove(0))
    }

    /// Appends all addresses of `other`, keeping their order.
    pub fn merge(&mut self, other: EvictionSet) {
        self.addrs.extend(other.addrs);
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// `true` if the set holds no address.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// `true` if `addr` is part of the set.
    pub fn contains(&self, addr: *const u8) -> bool {
        self.addrs.iter().any(|&a| a as *const u8 == addr)
    }

    /// Iterates over the addresses in order.
    pub fn iter(&self) -> impl Iterator<Item = *mut u8> + '_ {
        self.addrs.iter().copied()
    }

    /// The addresses as a slice.
    pub fn as_slice(&self) -> &[*mut u8] {
        &self.addrs
    }
}

impl From<Vec<*mut u8>> for EvictionSet {
    fn from(addrs: Vec<*mut u8>) -> Self {
        EvictionSet { addrs }
    }
}

impl FromIterator<*mut u8> for EvictionSet {
    fn from_iter<T: IntoIterator<Item = *mut u8>>(iter: T) -> Self {
        EvictionSet {
            addrs: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for EvictionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-----------  EV SET  -----------")?;
        for (i, addr) in self.addrs.iter().enumerate() {
            writeln!(f, "    {:2}: {:p}", i, *addr)?;
        }
        Ok(())
    }
}

impl Serialize for EvictionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.addrs.iter().map(|a| format!("{:p}", *a)))
    }
}

/// Something that finds eviction set candidates for a victim in a pool.
pub trait EvictionSetBuilder {
    /// Error type of this builder
    type Error: std::error::Error;

    /// Short name for logs and results.
    fn name(&self) -> &'static str;

    /// Searches the bytes `window` of `pool` for addresses colliding with `victim`.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the search cannot run.
    fn build_window(
        &mut self,
        victim: *mut u8,
        pool: &Memory,
        window: Range<usize>,
    ) -> Result<EvictionSet, Self::Error>;

    /// Searches the whole pool.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the search cannot run.
    fn build(&mut self, victim: *mut u8, pool: &Memory) -> Result<EvictionSet, Self::Error> {
        self.build_window(victim, pool, 0..pool.len())
    }
}

impl<T: EvictionSetBuilder + ?Sized> EvictionSetBuilder for &mut T {
    type Error = T::Error;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn build_window(
        &mut self,
        victim: *mut u8,
        pool: &Memory,
        window: Range<usize>,
    ) -> Result<EvictionSet, Self::Error> {
        (**self).build_window(victim, pool, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<*mut u8> {
        (0..n).map(|i| (0x1000 * (i + 1)) as *mut u8).collect()
    }

    #[test]
    fn test_push_remove_order() {
        let mut set = EvictionSet::from(addrs(4));
        assert_eq!(set.len(), 4);
        assert_eq!(set.pop_front(), Some(0x1000 as *mut u8));
        assert_eq!(set.remove(1), 0x3000 as *mut u8);
        set.push(0x1000 as *mut u8);
        assert_eq!(
            set.as_slice(),
            &[0x2000 as *mut u8, 0x4000 as *mut u8, 0x1000 as *mut u8]
        );
        assert!(set.contains(0x4000 as *const u8));
        assert!(!set.contains(0x3000 as *const u8));
    }

    #[test]
    fn test_pop_front_empty() {
        let mut set = EvictionSet::new();
        assert!(set.is_empty());
        assert_eq!(set.pop_front(), None);
    }

    #[test]
    fn test_merge_keeps_order() {
        let mut a: EvictionSet = addrs(2).into_iter().collect();
        let b: EvictionSet = addrs(4).into_iter().skip(2).collect();
        a.merge(b);
        assert_eq!(a.as_slice(), addrs(4).as_slice());
    }

    #[test]
    fn test_serialize_hex() -> anyhow::Result<()> {
        let set = EvictionSet::from(vec![0x1040 as *mut u8]);
        assert_eq!(serde_json::to_string(&set)?, r#"["0x1040"]"#);
        Ok(())
    }

    #[test]
    fn test_display() {
        let set = EvictionSet::from(addrs(2));
        let s = set.to_string();
        assert!(s.contains(" 0: 0x1000"));
        assert!(s.contains(" 1: 0x2000"));
    }
}
