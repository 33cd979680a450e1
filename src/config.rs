//! Run configuration
//!
//! Loaded once from a JSON file, validated, and shared as `Arc<Config>`.

use crate::error::{AppError, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_KEY_ENV: &str = "FINNHUB_API_KEY";

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_conns: u32,
    pub min_conns: u32,
    pub max_conn_lifetime_secs: u64,
    pub max_conn_idle_secs: u64,
    /// Also paces keep-alive pings during long aggregate passes
    pub health_check_period_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 4,
            min_conns: 1,
            max_conn_lifetime_secs: 3600,
            max_conn_idle_secs: 600,
            health_check_period_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_conn_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.max_conn_idle_secs)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_period_secs)
    }
}

/// Market data API settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Minimum spacing between any two outbound calls
    pub request_interval_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: crate::sources::finnhub::DEFAULT_BASE_URL.to_string(),
            api_key: None,
            request_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: String,
    pub resolution: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub timezone: Tz,
    /// SQLite database path
    pub data_source: PathBuf,
    pub pool: PoolConfig,
    pub api: ApiConfig,
    /// Stocks to skip from the start of the listing
    pub skip: usize,
    /// Max stocks to process after `skip`; 0 means all
    pub limit: usize,
    /// Lookback for symbols with no successful candles yet
    pub initial_lookback_days: i64,
    /// Drop landing rows of earlier runs when a run starts
    pub purge_raw_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: "US".to_string(),
            resolution: "D".to_string(),
            start_date: None,
            end_date: None,
            timezone: chrono_tz::America::New_York,
            data_source: PathBuf::from("stocker.db"),
            pool: PoolConfig::default(),
            api: ApiConfig::default(),
            skip: 0,
            limit: 0,
            initial_lookback_days: 365,
            purge_raw_on_start: false,
        }
    }
}

impl Config {
    /// Load and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(text)
            .map_err(|e| AppError::Config(format!("Invalid config: {}", e)))?;

        if config.api.api_key.as_deref().map_or(true, str::is_empty) {
            config.api.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.trim().is_empty() {
            return Err(AppError::Config("exchange must not be empty".into()));
        }
        if self.resolution.trim().is_empty() {
            return Err(AppError::Config("resolution must not be empty".into()));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                tracing::warn!("end_date {} is before start_date {}, window will be swapped", end, start);
            }
        }
        if self.initial_lookback_days <= 0 {
            return Err(AppError::Config(
                "initial_lookback_days must be positive".into(),
            ));
        }
        if self.pool.max_conns == 0 {
            return Err(AppError::Config("pool.max_conns must be at least 1".into()));
        }
        if self.pool.min_conns > self.pool.max_conns {
            return Err(AppError::Config(format!(
                "pool.min_conns ({}) exceeds pool.max_conns ({})",
                self.pool.min_conns, self.pool.max_conns
            )));
        }
        Ok(())
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.api.request_interval_ms.max(1))
    }

    /// API key, required only when talking to the live source
    pub fn api_key(&self) -> Result<&str> {
        self.api.api_key.as_deref().ok_or_else(|| {
            AppError::Config(format!(
                "api.api_key is not set and {} is empty",
                API_KEY_ENV
            ))
        })
    }
}
