//! Engine configuration
//!
//! Loaded from a JSON file; every field has a default so a missing file
//! yields a runnable configuration. The risk-free rate used by the implied
//! volatility solver is deliberately an external input here rather than a
//! hardcoded constant.

use crate::error::{AppError, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path
    pub db_path: PathBuf,
    /// Underlying name as it appears in the instrument master
    pub underlying: String,
    /// Instrument token of the spot index
    pub spot_token: i64,
    /// Annualized risk-free rate for IV inversion (e.g. 0.065 = 6.5%)
    pub risk_free_rate: f64,
    /// A leg older than this is stale and skips the cycle
    pub staleness_secs: i64,
    /// Computation cadence
    pub compute_interval_secs: u64,
    /// Time-to-expiry floor (years) below which cost of carry is null
    pub min_tte_years: f64,
    /// Storage retry budget
    pub retry: RetryConfig,
    /// Optional instrument master JSON to load at startup
    pub instrument_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("carrytrack.db"),
            underlying: "NIFTY".into(),
            spot_token: 256265,
            risk_free_rate: 0.065,
            staleness_secs: 120,
            compute_interval_secs: 30,
            min_tte_years: 1.0 / (365.0 * 24.0),
            retry: RetryConfig::default(),
            instrument_file: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("Bad config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.spot_token <= 0 {
            return Err(AppError::Config("spot_token must be positive".into()));
        }
        if self.underlying.is_empty() {
            return Err(AppError::Config("underlying must not be empty".into()));
        }
        if !(0.0..1.0).contains(&self.risk_free_rate) {
            return Err(AppError::Config(format!(
                "risk_free_rate out of range: {}",
                self.risk_free_rate
            )));
        }
        if self.staleness_secs <= 0 {
            return Err(AppError::Config("staleness_secs must be positive".into()));
        }
        if self.compute_interval_secs == 0 {
            return Err(AppError::Config(
                "compute_interval_secs must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}
