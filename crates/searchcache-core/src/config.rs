//! Configuration management for the search cache
//!
//! Handles loading and validation of `searchcache.toml` files. Every section
//! and field is optional; missing values take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backfill::{BYTES_PER_RUN, run_budget};
use crate::error::ConfigError;
use crate::filter::CancelToken;
use crate::logging::LogConfig;
use crate::monitor::MonitorSettings;
use crate::query::RunQuery;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCacheConfig {
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Index configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of fingerprint shards
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
        }
    }
}

fn default_shards() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Memory monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Time between heap checks in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,

    /// Heap budget; 0 uses the backfill byte budget
    #[serde(default)]
    pub max_heap_bytes: u64,

    /// Fraction of resident runs evicted per over-budget check
    #[serde(default = "default_eviction_fraction")]
    pub eviction_fraction: f64,

    /// Ingested runs between forced checks; 0 disables
    #[serde(default = "default_max_ingested_runs")]
    pub max_ingested_runs: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval(),
            max_heap_bytes: 0,
            eviction_fraction: default_eviction_fraction(),
            max_ingested_runs: default_max_ingested_runs(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    5_000
}

fn default_eviction_fraction() -> f64 {
    0.1
}

fn default_max_ingested_runs() -> usize {
    10
}

/// Backfill configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Memory budget for resident runs
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Assumed average resident size of one run
    #[serde(default = "default_bytes_per_run")]
    pub bytes_per_run: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            bytes_per_run: default_bytes_per_run(),
        }
    }
}

impl BackfillConfig {
    #[must_use]
    pub fn run_budget(&self) -> usize {
        run_budget(self.max_bytes, self.bytes_per_run)
    }
}

fn default_max_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_bytes_per_run() -> u64 {
    BYTES_PER_RUN
}

/// Poll configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,

    /// Runs fetched per iteration
    #[serde(default = "default_poll_max_runs")]
    pub max_runs: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_runs: default_poll_max_runs(),
        }
    }
}

impl PollConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_poll_interval() -> u64 {
    10_000
}

fn default_poll_max_runs() -> usize {
    10
}

/// Query configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Upper bound on `run_ids` in one request
    #[serde(default = "default_max_runs_per_request")]
    pub max_runs_per_request: usize,

    /// Plan execution deadline in milliseconds
    #[serde(default)]
    pub execute_timeout_ms: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_runs_per_request: default_max_runs_per_request(),
            execute_timeout_ms: None,
        }
    }
}

impl QueryConfig {
    /// Parses a request body and enforces `max_runs_per_request`.
    pub fn parse_request(&self, body: &str) -> crate::Result<RunQuery> {
        let request = RunQuery::from_json(body)?;
        request.check_run_limit(self.max_runs_per_request)?;
        Ok(request)
    }

    /// Fresh token carrying the configured deadline, if any.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        match self.execute_timeout_ms {
            Some(ms) => CancelToken::new().with_timeout(Duration::from_millis(ms)),
            None => CancelToken::new(),
        }
    }
}

fn default_max_runs_per_request() -> usize {
    16
}

/// Upstream service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL for run listings and metadata
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

fn default_base_url() -> String {
    "https://wpt.fyi".to_string()
}

impl SearchCacheConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.shards == 0 {
            return Err(ConfigError::ValidationError(
                "index.shards must be at least 1".to_string(),
            ));
        }
        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.interval_ms must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.monitor.eviction_fraction) {
            return Err(ConfigError::ValidationError(format!(
                "monitor.eviction_fraction must be within [0, 1], got {}",
                self.monitor.eviction_fraction
            )));
        }
        if self.backfill.bytes_per_run == 0 {
            return Err(ConfigError::ValidationError(
                "backfill.bytes_per_run must be greater than 0".to_string(),
            ));
        }
        if self.poll.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.query.max_runs_per_request == 0 {
            return Err(ConfigError::ValidationError(
                "query.max_runs_per_request must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn monitor_settings(&self) -> MonitorSettings {
        let max_heap_bytes = if self.monitor.max_heap_bytes == 0 {
            self.backfill.max_bytes
        } else {
            self.monitor.max_heap_bytes
        };
        MonitorSettings {
            interval: Duration::from_millis(self.monitor.interval_ms),
            max_heap_bytes,
            eviction_fraction: self.monitor.eviction_fraction,
            max_ingested_runs: self.monitor.max_ingested_runs,
        }
    }
}
