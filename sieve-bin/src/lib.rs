//! # Sieve binaries
//!
//! Shared setup for the command line tools:
//!
//! - `evsets`: builds a minimal eviction set for a random victim and writes
//!   the result as JSON.
//! - `cache_timing`: calibrates hit/miss thresholds, checks how well they
//!   separate cached from flushed accesses and runs a covert channel demo.
//!
//! Both tools should run pinned to one core of an otherwise idle machine.

use std::fs::File;
use std::io::{BufWriter, Write};

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::info;
use serde::Serialize;
use sieve_core::SieveConfig;

/// Initializes `env_logger` (default level `info`) behind a progress bar bridge.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Loads the configuration file if given, then applies `SIEVE_*` variables.
pub fn load_config(path: Option<&str>) -> anyhow::Result<SieveConfig> {
    let config = match path {
        Some(path) => {
            SieveConfig::from_jsonfile(path)?.with_vars(|var| std::env::var(var).ok())?
        }
        None => SieveConfig::from_env()?,
    };
    info!("Configuration: {:?}", config);
    Ok(config)
}

/// Writes `data` as pretty JSON to `filename`.
pub fn save_json<T: Serialize>(data: &T, filename: &str) -> anyhow::Result<()> {
    let file = File::create(filename)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)?;
    writer.flush()?;
    info!("Results saved to {}", filename);
    Ok(())
}
