use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::MultiProgress;
use log::{error, info, warn};
use rand::Rng as _;
use serde::Serialize;
use sieve_bin::{init_logging_with_progress, load_config, save_json};
use sieve_core::calibration::{Thresholds, calibrate_flush_reload};
use sieve_core::evset::{EvictionOracle, EvictionSetBuilder, EvictionTester, TimedEvictionProbe};
use sieve_core::geometry::CacheGeometry;
use sieve_core::memory::{BytePointer, LinuxPageMap, Memory};
use sieve_core::timer::{TimerKind, timer_from_config};
use sieve_core::util::{CL_SIZE, PAGE_SIZE, Rng, Size, is_root, pin_to_core};
use sieve_core::verify::PhysicalVerifier;
use sieve_core::{EvsetConfig, Sieve, SieveReport};
use sieve_pagemap::PageMapBuilder;
use sieve_write_write::{ScanStats, TimedCollisionProbe, WriteWrite};

/// CLI arguments for the `evsets` binary.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// JSON configuration file, `SIEVE_*` variables are applied on top.
    #[clap(long = "config")]
    config: Option<String>,
    /// The eviction set builder (`write-write` or `pagemap`).
    #[clap(long = "builder", default_value = "write-write")]
    builder: String,
    /// Size of the candidate pool.
    #[clap(long = "pool-size", default_value = "800MB")]
    pool_size: Size,
    /// Pin to this core.
    #[clap(long = "core", default_value = "0")]
    core: usize,
    /// Timer backend, probed if not given.
    #[clap(long = "timer")]
    timer: Option<TimerKind>,
    /// Use the calibrated Flush+Reload miss threshold for eviction tests.
    #[clap(long = "calibrate")]
    calibrate: bool,
    /// Confirm collisions with physical addresses (requires root).
    #[clap(long = "verify")]
    verify: bool,
    /// Scan the pool window by window and stop at the first reducible set.
    #[clap(long = "incremental")]
    incremental: bool,
    /// Window size of the incremental scan.
    #[clap(long = "window", default_value = "400KB")]
    window: Size,
    /// Number of victims to build eviction sets for.
    #[clap(long = "repeat", default_value = "1")]
    repeat: usize,
    /// Seed for the victim choice.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
}

#[derive(Debug, Serialize)]
struct Attempt {
    victim: String,
    duration_ms: u64,
    report: Option<SieveReport>,
    error: Option<String>,
    scan: Option<ScanStats>,
    implausible_samples: u64,
}

#[derive(Debug, Serialize)]
struct EvsetResults {
    args: CliArgs,
    date: String,
    seed: u64,
    timer: TimerKind,
    geometry: Option<CacheGeometry>,
    miss_threshold: u64,
    thresholds: Option<Thresholds>,
    attempts: Vec<Attempt>,
}

enum Builder<'a> {
    WriteWrite(WriteWrite<TimedCollisionProbe<'a>>),
    PageMap(PageMapBuilder<LinuxPageMap>),
}

struct Run<'a> {
    args: &'a CliArgs,
    config: &'a EvsetConfig,
    progress: &'a MultiProgress,
    pool: &'a Memory,
}

impl Run<'_> {
    fn sieve<B: EvictionSetBuilder, O: EvictionOracle>(
        &self,
        builder: &mut B,
        oracle: O,
        victim: *mut u8,
    ) -> std::result::Result<SieveReport, String> {
        let builder: Box<dyn EvictionSetBuilder<Error = B::Error> + '_> = Box::new(builder);
        let mut sieve =
            Sieve::new(builder, oracle, self.config.clone()).with_progress(self.progress.clone());
        let res = if self.args.incremental {
            sieve.run_incremental(victim, self.pool, self.args.window.bytes())
        } else {
            sieve.run(victim, self.pool)
        };
        res.map_err(|e| e.to_string())
    }
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    if args.verify && !is_root() {
        error!("--verify resolves physical addresses and requires root");
        std::process::exit(1);
    }
    let config = load_config(args.config.as_deref())?;
    pin_to_core(args.core).with_context(|| format!("pinning to core {}", args.core))?;

    let timer = timer_from_config(args.timer.or(config.timer))?;
    let geometry = match CacheGeometry::detect(&config) {
        Ok(geometry) => {
            info!("LLC geometry: {:?}", geometry);
            Some(geometry)
        }
        Err(e) => {
            warn!("Cache geometry unavailable: {}", e);
            None
        }
    };

    let thresholds = if args.calibrate {
        Some(calibrate_flush_reload(&*timer, &config)?)
    } else {
        None
    };
    let miss_threshold = thresholds
        .map(|t| t.miss)
        .or(config.miss_threshold)
        .unwrap_or(config.evset.miss_threshold);
    let tester = EvictionTester::new(TimedEvictionProbe::new(&*timer), &config.evset)
        .with_miss_threshold(miss_threshold);
    info!("Eviction test miss threshold: {}", miss_threshold);

    let mut rng = args.seed.map(Rng::from_seed).unwrap_or_else(Rng::from_entropy);
    let pool = Memory::mmap(args.pool_size.bytes(), 0)?;
    let victims = Memory::mmap(PAGE_SIZE, 0)?;
    let run = Run {
        args: &args,
        config: &config.evset,
        progress: &progress,
        pool: &pool,
    };

    let mut builder = match args.builder.as_str() {
        "write-write" => {
            let mut ww = WriteWrite::new(
                TimedCollisionProbe::new(&*timer),
                config.evset.clone(),
                Some(progress.clone()),
            );
            if args.verify {
                let Some(geometry) = geometry else {
                    bail!("--verify needs the cache geometry");
                };
                ww = ww.with_verifier(Box::new(PhysicalVerifier::new(
                    LinuxPageMap::new()?,
                    geometry,
                )));
            }
            Builder::WriteWrite(ww)
        }
        "pagemap" => {
            if !is_root() {
                warn!("The pagemap builder needs root, physical addresses will be unavailable");
            }
            let Some(geometry) = geometry else {
                bail!("The pagemap builder needs the cache geometry");
            };
            Builder::PageMap(PageMapBuilder::linux(geometry, Some(progress.clone()))?)
        }
        other => bail!("Unknown builder '{}'", other),
    };

    let mut attempts = vec![];
    for rep in 1..=args.repeat {
        let victim = victims.addr(rng.random_range(0..PAGE_SIZE / CL_SIZE) * CL_SIZE);
        info!("Victim {}/{}: {:p}", rep, args.repeat, victim);
        let implausible_before = tester.implausible_samples();
        let start = Instant::now();
        let (res, scan) = match &mut builder {
            Builder::WriteWrite(ww) => {
                let before = *ww.stats();
                let res = run.sieve(ww, &tester, victim);
                if let Ok(report) = &res {
                    ww.describe(&report.eviction_set, victim);
                }
                (res, Some(ww.stats().since(&before)))
            }
            Builder::PageMap(pm) => (run.sieve(pm, &tester, victim), None),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        match &res {
            Ok(report) => info!(
                "Minimal eviction set of {} addresses after {} ms:\n{}",
                report.eviction_set.len(),
                duration_ms,
                report.eviction_set
            ),
            Err(e) => info!("No minimal eviction set found: {}", e),
        }
        let (report, error) = match res {
            Ok(report) => (Some(report), None),
            Err(e) => (None, Some(e)),
        };
        attempts.push(Attempt {
            victim: format!("{:p}", victim),
            duration_ms,
            report,
            error,
            scan,
            implausible_samples: tester.implausible_samples() - implausible_before,
        });
    }

    let found = attempts.iter().filter(|a| a.report.is_some()).count();
    info!("=== SUMMARY ===");
    info!("Eviction sets found: {}/{}", found, attempts.len());

    if let Some(output) = &args.output {
        let results = EvsetResults {
            args: args.clone(),
            date: chrono::Local::now().to_rfc3339(),
            seed: rng.seed(),
            timer: timer.kind(),
            geometry,
            miss_threshold,
            thresholds,
            attempts,
        };
        save_json(&results, output)?;
    }
    victims.dealloc();
    pool.dealloc();
    Ok(())
}
