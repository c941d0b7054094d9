//! # Sieve Core
//!
//! `sieve-core` is the foundational library of the Sieve cache side-channel
//! toolkit. It provides serialized timers, cache access primitives, threshold
//! calibration and a trait-based architecture for constructing minimal
//! eviction sets.
//!
//! ## Architecture Overview
//!
//! The toolkit is built around three traits:
//!
//! - [`timer::Timer`] - A serialized timestamp source. Backends are the cycle
//!   counter, the OS monotonic clock and a counting thread.
//!
//! - [`evset::EvictionSetBuilder`] - Finds candidate addresses colliding with
//!   a victim in a memory pool, e.g. by write+write timing or from physical
//!   addresses.
//!
//! - [`evset::EvictionOracle`] - Decides whether a set of addresses evicts a
//!   victim. [`evset::EvictionTester`] implements it with timed reloads.
//!
//! ## Main Components
//!
//! - [`Sieve`] - The orchestrator combining a builder and an oracle to build,
//!   test and reduce eviction sets.
//!
//! - [`calibration`] and [`probe`] - Hit/miss thresholds and the classic
//!   Flush+Reload, Evict+Reload and Prime+Probe primitives.
//!
//! - [`geometry`] - Last-level cache geometry from CPUID or sysfs and the
//!   mapping of physical addresses to cache sets and slices.
//!
//! - [`memory`] - mmap'd pools and virtual to physical translation.
//!
//! - [`config`] - The immutable [`config::SieveConfig`], loaded from JSON and
//!   `SIEVE_*` environment variables.
//!
//! ## Platform Support
//!
//! Sieve targets x86_64 Linux. Physical address translation through
//! `/proc/self/pagemap` requires root.

#![warn(missing_docs)]

pub mod access;
pub mod calibration;
pub mod config;
pub mod covert;
pub mod evset;
pub mod geometry;
pub mod memory;
pub mod probe;
mod sieve;
pub mod timer;
pub mod util;
pub mod verify;

pub use crate::config::{ConfigError, EvictionStrategy, EvsetConfig, SieveConfig};
pub use crate::sieve::{DEFAULT_WINDOW, Sieve, SieveError, SieveReport};
