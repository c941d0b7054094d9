//! Write+write timing eviction set builder.
//!
//! Writing to the victim right after writing to an address in the same
//! last-level cache set is measurably slower than after writing to an
//! unrelated address. [`WriteWrite`] scans a pool in pairs of pages, times
//! both members of each pair against the victim and keeps the slower one
//! when the difference is significant.
//!
//! Implements the [`sieve_core::evset::EvictionSetBuilder`] trait.
//!
//! No privileges are required. Physical confirmation of the found
//! collisions can be enabled with [`WriteWrite::with_verifier`].

#![warn(missing_docs)]

mod probe;
mod write_write;

pub use probe::{CollisionProbe, TimedCollisionProbe};
pub use write_write::{Error, ScanStats, WriteWrite};
