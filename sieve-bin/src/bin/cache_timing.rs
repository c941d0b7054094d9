use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use sieve_bin::{init_logging_with_progress, load_config, save_json};
use sieve_core::calibration::{Separation, Thresholds, calibrate_flush_reload, threshold_separation};
use sieve_core::covert::{CovertChannel, ENTRIES};
use sieve_core::geometry::CacheGeometry;
use sieve_core::probe::CacheProbe;
use sieve_core::timer::{TimerKind, timer_from_config};
use sieve_core::util::{CACHE_ASSOC, Rng, pin_to_core};

/// CLI arguments for the `cache_timing` binary.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// JSON configuration file, `SIEVE_*` variables are applied on top.
    #[clap(long = "config")]
    config: Option<String>,
    /// Pin to this core.
    #[clap(long = "core", default_value = "0")]
    core: usize,
    /// Timer backend, probed if not given.
    #[clap(long = "timer")]
    timer: Option<TimerKind>,
    /// Trials of the threshold separation check.
    #[clap(long = "trials", default_value = "10000")]
    trials: usize,
    /// Message sent over the covert channel.
    #[clap(long = "message", default_value = "Sieve")]
    message: String,
    /// Probe rounds per transmitted byte.
    #[clap(long = "iterations", default_value = "100")]
    iterations: usize,
    /// Seed for the channel memory contents.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
}

#[derive(Debug, Serialize)]
struct TimingResults {
    args: CliArgs,
    date: String,
    timer: TimerKind,
    thresholds: Thresholds,
    separation: Separation,
    received: String,
    byte_errors: usize,
}

fn main() -> Result<()> {
    let _progress = init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);
    let config = load_config(args.config.as_deref())?;
    pin_to_core(args.core).with_context(|| format!("pinning to core {}", args.core))?;

    let timer = timer_from_config(args.timer.or(config.timer))?;
    let thresholds = calibrate_flush_reload(&*timer, &config)?;
    let separation = threshold_separation(&*timer, &thresholds, args.trials)?;
    info!(
        "Threshold separation: {:.2}% hits below, {:.2}% misses above",
        separation.hit_rate() * 100.0,
        separation.miss_rate() * 100.0
    );
    if separation.hit_rate() < 0.95 || separation.miss_rate() < 0.95 {
        warn!("Thresholds separate poorly, is the machine idle and the core isolated?");
    }

    let ways = match CacheGeometry::detect(&config) {
        Ok(geometry) => geometry.ways,
        Err(e) => {
            warn!("Cache geometry unavailable ({}), assuming {} ways", e, CACHE_ASSOC);
            CACHE_ASSOC
        }
    };
    let probe = CacheProbe::new(&*timer, thresholds, &config, ways);
    let mut rng = args.seed.map(Rng::from_seed).unwrap_or_else(Rng::from_entropy);
    let channel = CovertChannel::new(probe, &mut rng)?;
    info!("Sending {:?} over the covert channel", args.message);
    let received = args
        .message
        .bytes()
        .map(|byte| {
            let hist = channel.histogram(args.iterations, |c| c.encode(byte));
            (0..ENTRIES).max_by_key(|&i| hist[i]).unwrap_or_default() as u8
        })
        .collect::<Vec<u8>>();
    channel.dealloc();
    let byte_errors = args
        .message
        .bytes()
        .zip(&received)
        .filter(|(sent, got)| sent != *got)
        .count();
    let received = String::from_utf8_lossy(&received).into_owned();
    info!("Received {:?} with {} byte errors", received, byte_errors);

    if let Some(output) = &args.output {
        let results = TimingResults {
            args: args.clone(),
            date: chrono::Local::now().to_rfc3339(),
            timer: timer.kind(),
            thresholds,
            separation,
            received,
            byte_errors,
        };
        save_json(&results, output)?;
    }
    Ok(())
}
