//! Immutable runtime configuration.
//!
//! A [`SieveConfig`] is built once, from defaults, a JSON file or `SIEVE_*`
//! environment variables, and then passed by reference to every component.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timer::TimerKind;
use crate::util::{CACHE_ASSOC, CACHE_MISS_THRESHOLD, CALIBRATION_ROUNDS};

/// Errors that can occur when loading the configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid value '{value}' for {var}")]
    Invalid { var: String, value: String },
}

/// Result type for configuration constructors.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Shape of an access pattern over an eviction set.
///
/// Written as `C-D-L-S`: every window of `D + 1` consecutive addresses is
/// accessed `C + 1` times, and the window start advances by `L` up to `S`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EvictionStrategy {
    /// Repetitions of each window
    pub c: usize,
    /// Window width minus one
    pub d: usize,
    /// Step between windows
    pub l: usize,
    /// Last window start
    pub s: usize,
}

impl EvictionStrategy {
    /// Default strategy for Evict+Reload.
    pub const EVICTION: EvictionStrategy = EvictionStrategy {
        c: 4,
        d: 5,
        l: 5,
        s: 20,
    };

    /// Default strategy for Prime+Probe on a cache with `ways` ways.
    pub fn prime(ways: usize) -> Self {
        EvictionStrategy {
            c: 1,
            d: 2,
            l: 1,
            s: ways.saturating_sub(3),
        }
    }

    /// Number of addresses the pattern touches.
    pub fn required_addresses(&self) -> usize {
        self.s + self.c + self.d
    }
}

impl FromStr for EvictionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts = s
            .trim()
            .split('-')
            .map(|p| p.trim().parse::<usize>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid strategy '{}': {}", s, e))?;
        match parts[..] {
            [c, d, l, s] if l > 0 => Ok(EvictionStrategy { c, d, l, s }),
            [_, _, 0, _] => Err(format!("invalid strategy '{}': step must be positive", s)),
            _ => Err(format!("invalid strategy '{}': expected C-D-L-S", s)),
        }
    }
}

impl TryFrom<String> for EvictionStrategy {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EvictionStrategy> for String {
    fn from(value: EvictionStrategy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.c, self.d, self.l, self.s)
    }
}

/// Parameters of eviction set construction, testing and reduction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvsetConfig {
    /// Timed trials per decision branch of a candidate pair
    pub runs: usize,
    /// Samples above this many cycles are discarded and retried
    pub outlier_threshold: u64,
    /// Minimum difference of the branch means for a collision
    pub significance: u64,
    /// Functional test samples below this are retried
    pub plausible_min: u64,
    /// Functional test samples above this are retried
    pub plausible_max: u64,
    /// Target eviction set size
    pub associativity: usize,
    /// Failed attempts per reduction level beyond the associativity
    pub abort_slack: usize,
    /// Victim reload times above this count as evicted
    pub miss_threshold: u64,
}

impl Default for EvsetConfig {
    fn default() -> Self {
        EvsetConfig {
            runs: 10,
            outlier_threshold: 1400,
            significance: 10,
            plausible_min: 30,
            plausible_max: 400,
            associativity: CACHE_ASSOC,
            abort_slack: 2,
            miss_threshold: CACHE_MISS_THRESHOLD,
        }
    }
}

impl EvsetConfig {
    /// Failed attempts after which a reduction level gives up.
    pub fn max_attempts(&self) -> usize {
        self.associativity + self.abort_slack
    }

    /// `true` if a functional test sample lies in the plausible window.
    pub fn plausible(&self, time: u64) -> bool {
        (self.plausible_min..=self.plausible_max).contains(&time)
    }

    /// Rejects parameters that cannot produce a classification.
    ///
    /// Trials alternate between pair members two at a time, so fewer than
    /// two runs leave the second member unsampled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |var: &str, value: String| {
            Err(ConfigError::Invalid {
                var: var.to_string(),
                value,
            })
        };
        if self.runs < 2 {
            return invalid("evset.runs", self.runs.to_string());
        }
        if self.associativity == 0 {
            return invalid("evset.associativity", self.associativity.to_string());
        }
        if self.plausible_min > self.plausible_max {
            return invalid(
                "evset.plausible_min",
                format!("{} > {}", self.plausible_min, self.plausible_max),
            );
        }
        Ok(())
    }
}

/// Process-wide configuration.
///
/// Every `Option` field overrides a detected or calibrated value when set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SieveConfig {
    /// LLC slice count
    pub llc_slices: Option<usize>,
    /// LLC line size in bytes
    pub llc_line_size: Option<usize>,
    /// LLC set count over all slices
    pub llc_sets: Option<usize>,
    /// LLC physical line partitions
    pub llc_partitions: Option<usize>,
    /// Calibrated hit threshold
    pub hit_threshold: Option<u64>,
    /// Calibrated miss threshold
    pub miss_threshold: Option<u64>,
    /// Access pattern for Evict+Reload
    pub eviction_strategy: Option<EvictionStrategy>,
    /// Access pattern for Prime+Probe
    pub prime_strategy: Option<EvictionStrategy>,
    /// Base of the kernel's direct physical map
    pub direct_physical_map: Option<u64>,
    /// Timer backend, probed if unset
    pub timer: Option<TimerKind>,
    /// Iterations per calibration phase
    pub calibration_rounds: usize,
    /// Eviction set parameters
    pub evset: EvsetConfig,
}

impl Default for SieveConfig {
    fn default() -> Self {
        SieveConfig {
            llc_slices: None,
            llc_line_size: None,
            llc_sets: None,
            llc_partitions: None,
            hit_threshold: None,
            miss_threshold: None,
            eviction_strategy: None,
            prime_strategy: None,
            direct_physical_map: None,
            timer: None,
            calibration_rounds: CALIBRATION_ROUNDS,
            evset: EvsetConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(var: &str, value: String) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            value,
        })
}

fn parse_u64(var: &str, value: String) -> Result<u64> {
    let v = value.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    };
    parsed.ok_or(ConfigError::Invalid {
        var: var.to_string(),
        value,
    })
}

impl SieveConfig {
    /// Loads configuration from a JSON file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed, or if the eviction set
    /// parameters are invalid.
    pub fn from_jsonfile(filepath: impl AsRef<Path>) -> Result<SieveConfig> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: SieveConfig = serde_json::from_str(&contents)?;
        config.evset.validate()?;
        Ok(config)
    }

    /// Reads the `SIEVE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparsable values.
    pub fn from_env() -> Result<SieveConfig> {
        Self::default().with_vars(|var| std::env::var(var).ok())
    }

    /// Like [`SieveConfig::from_env`], but with an injected variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparsable values.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<SieveConfig> {
        Self::default().with_vars(lookup)
    }

    /// Applies variable overrides on top of `self`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparsable values.
    pub fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<SieveConfig> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("SIEVE_LLC_SLICES") {
            self.llc_slices = Some(parse_var("SIEVE_LLC_SLICES", v)?);
        }
        if let Some(v) = get("SIEVE_LLC_LINE_SIZE") {
            self.llc_line_size = Some(parse_var("SIEVE_LLC_LINE_SIZE", v)?);
        }
        if let Some(v) = get("SIEVE_LLC_SETS") {
            self.llc_sets = Some(parse_var("SIEVE_LLC_SETS", v)?);
        }
        if let Some(v) = get("SIEVE_LLC_PARTITIONS") {
            self.llc_partitions = Some(parse_var("SIEVE_LLC_PARTITIONS", v)?);
        }
        if let Some(v) = get("SIEVE_HIT_THRESHOLD") {
            self.hit_threshold = Some(parse_u64("SIEVE_HIT_THRESHOLD", v)?);
        }
        if let Some(v) = get("SIEVE_MISS_THRESHOLD") {
            self.miss_threshold = Some(parse_u64("SIEVE_MISS_THRESHOLD", v)?);
        }
        if let Some(v) = get("SIEVE_EVICTION_STRATEGY") {
            self.eviction_strategy = Some(parse_var("SIEVE_EVICTION_STRATEGY", v)?);
        }
        if let Some(v) = get("SIEVE_PRIME_STRATEGY") {
            self.prime_strategy = Some(parse_var("SIEVE_PRIME_STRATEGY", v)?);
        }
        if let Some(v) = get("SIEVE_DIRECT_PHYSICAL_MAP") {
            self.direct_physical_map = Some(parse_u64("SIEVE_DIRECT_PHYSICAL_MAP", v)?);
        }
        if let Some(v) = get("SIEVE_TIMER") {
            self.timer = Some(parse_var("SIEVE_TIMER", v)?);
        }
        Ok(self)
    }

    /// Eviction strategy, configured or default.
    pub fn eviction_strategy(&self) -> EvictionStrategy {
        self.eviction_strategy.unwrap_or(EvictionStrategy::EVICTION)
    }

    /// Prime strategy, configured or derived from the associativity.
    pub fn prime_strategy(&self, ways: usize) -> EvictionStrategy {
        self.prime_strategy
            .unwrap_or_else(|| EvictionStrategy::prime(ways))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "4-5-5-20".parse::<EvictionStrategy>(),
            Ok(EvictionStrategy::EVICTION)
        );
        assert!("4-5-5".parse::<EvictionStrategy>().is_err());
        assert!("4-5-0-20".parse::<EvictionStrategy>().is_err());
        assert!("a-b-c-d".parse::<EvictionStrategy>().is_err());
        assert_eq!(EvictionStrategy::EVICTION.to_string(), "4-5-5-20");
        assert_eq!(EvictionStrategy::EVICTION.required_addresses(), 29);
    }

    #[test]
    fn test_default_prime_strategy() {
        let config = SieveConfig::default();
        assert_eq!(
            config.prime_strategy(16),
            EvictionStrategy {
                c: 1,
                d: 2,
                l: 1,
                s: 13
            }
        );
    }

    #[test]
    fn test_from_vars() -> anyhow::Result<()> {
        let config = SieveConfig::from_vars(vars(&[
            ("SIEVE_LLC_SLICES", "8"),
            ("SIEVE_LLC_SETS", "16384"),
            ("SIEVE_MISS_THRESHOLD", "180"),
            ("SIEVE_DIRECT_PHYSICAL_MAP", "0xffff888000000000"),
            ("SIEVE_TIMER", "monotonic"),
            ("SIEVE_LLC_LINE_SIZE", ""),
        ]))?;
        assert_eq!(config.llc_slices, Some(8));
        assert_eq!(config.llc_sets, Some(16384));
        assert_eq!(config.miss_threshold, Some(180));
        assert_eq!(config.hit_threshold, None);
        assert_eq!(config.llc_line_size, None);
        assert_eq!(config.direct_physical_map, Some(0xffff_8880_0000_0000));
        assert_eq!(config.timer, Some(TimerKind::Monotonic));
        Ok(())
    }

    #[test]
    fn test_prime_var_sets_prime_strategy_only() -> anyhow::Result<()> {
        let config = SieveConfig::from_vars(vars(&[("SIEVE_PRIME_STRATEGY", "2-3-1-10")]))?;
        assert_eq!(config.eviction_strategy, None);
        assert_eq!(config.eviction_strategy(), EvictionStrategy::EVICTION);
        assert_eq!(config.prime_strategy(16).to_string(), "2-3-1-10");
        Ok(())
    }

    #[test]
    fn test_invalid_var() {
        let err = SieveConfig::from_vars(vars(&[("SIEVE_LLC_SLICES", "many")]));
        assert!(matches!(
            err,
            Err(ConfigError::Invalid { ref var, .. }) if var == "SIEVE_LLC_SLICES"
        ));
    }

    #[test]
    fn test_json_partial() -> anyhow::Result<()> {
        let config: SieveConfig = serde_json::from_str(
            r#"{ "eviction_strategy": "2-2-2-10", "evset": { "runs": 20 } }"#,
        )?;
        assert_eq!(config.eviction_strategy().s, 10);
        assert_eq!(config.evset.runs, 20);
        assert_eq!(config.evset.outlier_threshold, 1400);
        assert_eq!(config.calibration_rounds, CALIBRATION_ROUNDS);
        Ok(())
    }

    #[test]
    fn test_json_file_roundtrip() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("sieve-config-{}.json", std::process::id()));
        let config = SieveConfig {
            llc_slices: Some(4),
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&config)?)?;
        let loaded = SieveConfig::from_jsonfile(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_json_file_rejects_single_run() -> anyhow::Result<()> {
        let path =
            std::env::temp_dir().join(format!("sieve-config-runs-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "evset": { "runs": 1 } }"#)?;
        let loaded = SieveConfig::from_jsonfile(&path);
        std::fs::remove_file(&path)?;
        assert!(matches!(
            loaded,
            Err(ConfigError::Invalid { ref var, ref value }) if var == "evset.runs" && value == "1"
        ));
        Ok(())
    }

    #[test]
    fn test_evset_validate() {
        assert!(EvsetConfig::default().validate().is_ok());
        let zero_ways = EvsetConfig {
            associativity: 0,
            ..Default::default()
        };
        assert!(zero_ways.validate().is_err());
        let inverted = EvsetConfig {
            plausible_min: 500,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_evset_limits() {
        let c = EvsetConfig::default();
        assert_eq!(c.max_attempts(), 18);
        assert!(c.plausible(30));
        assert!(c.plausible(400));
        assert!(!c.plausible(29));
        assert!(!c.plausible(401));
    }
}
