//! # Sieve
//!
//! Sieve is a toolkit for cache timing side-channels on x86_64 Linux. Its
//! centerpiece is the construction of minimal last-level cache eviction sets
//! from unprivileged timing measurements.
//!
//! ## Quickstart guide
//!
//! ```sh
//! cargo build --release
//! # build an eviction set for a random victim on core 0
//! target/release/evsets --core 0 --pool-size 800MB --output evsets.json
//! # calibrate thresholds and run the covert channel demo
//! target/release/cache_timing --core 0
//! ```
//!
//! ## Modules
//!
//! - `timer`: serialized timestamp sources.
//! - `access`, `calibration`, `probe`: cache primitives and thresholds.
//! - `evset`: eviction sets, the functional test and the reduction.
//! - `geometry`, `memory`, `verify`: cache geometry and physical addresses.
//! - `config`: the immutable configuration.
//!
//! ## Builders
//!
//! - `write-write` (default): [`sieve_write_write::WriteWrite`], unprivileged.
//! - `pagemap`: [`sieve_pagemap::PageMapBuilder`], requires root.

pub use sieve_core::*;

#[cfg(feature = "pagemap")]
pub use sieve_pagemap;
#[cfg(feature = "write-write")]
pub use sieve_write_write;
