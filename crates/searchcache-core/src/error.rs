//! Error types for searchcache-core

use thiserror::Error;

use crate::run::RunId;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for searchcache-core
#[derive(Error, Debug)]
pub enum Error {
    /// A run without an identity was offered for ingestion
    #[error("cannot ingest a run with id 0")]
    NilRun,

    /// Bind or eviction was asked to operate on an empty run set
    #[error("no runs")]
    NoRuns,

    /// Bind was called without a query
    #[error("no query provided")]
    NoQuery,

    /// The run is already resident in the index
    #[error("run already loaded: {0}")]
    RunExists(RunId),

    /// The run is currently being loaded by another caller
    #[error("run is currently being loaded: {0}")]
    RunLoading(RunId),

    /// The run is not resident (never ingested, or evicted since)
    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    /// An index was constructed with zero shards
    #[error("index requires at least one shard")]
    SomeShardsRequired,

    /// A non-empty subtest name hashed onto the "no subtest" sentinel
    #[error("subtest id for string {0:?} is 0")]
    ZeroSubtestHash(String),

    /// A fingerprint is not present in the test registry
    #[error("test not found in registry: {0}")]
    TestNotFound(String),

    /// Query execution was cancelled or exceeded its deadline
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Query parsing errors
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Memory monitor state errors
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Report loading failures not covered by transport errors
    #[error("report load failed for run {run}: {reason}")]
    Load { run: RunId, reason: String },

    /// Upstream payload was well-formed JSON but not a shape we understand
    #[error("unexpected upstream payload: {0}")]
    Upstream(String),

    /// Upstream HTTP failures (run listing, reports, metadata)
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NilRun => "index.nil_run",
            Self::NoRuns => "index.no_runs",
            Self::NoQuery => "index.no_query",
            Self::RunExists(_) => "index.run_exists",
            Self::RunLoading(_) => "index.run_loading",
            Self::UnknownRun(_) => "index.unknown_run",
            Self::SomeShardsRequired => "index.some_shards_required",
            Self::ZeroSubtestHash(_) => "registry.zero_subtest_hash",
            Self::TestNotFound(_) => "registry.test_not_found",
            Self::Cancelled(_) => "plan.cancelled",
            Self::Query(err) => err.code(),
            Self::Monitor(err) => err.code(),
            Self::Config(_) => "config.invalid",
            Self::Load { .. } => "loader.failed",
            Self::Upstream(_) => "upstream.payload",
            Self::Http(_) => "upstream.http",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Ingestion outcomes that are routine when several producers race to
    /// load the same run.
    #[must_use]
    pub fn is_expected_ingest_skip(&self) -> bool {
        matches!(self, Self::RunExists(_) | Self::RunLoading(_))
    }
}

/// Query parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The fragment matched none of the known query shapes
    #[error("failed to parse query fragment as any of the existing search atoms")]
    UnknownFragment,

    /// `run_ids` missing or empty in a run query
    #[error(r#"missing run query property: "run_ids""#)]
    MissingRunIds,

    /// Status string is not a known test status
    #[error("invalid test status: {0:?}")]
    InvalidStatus(String),

    /// Product spec could not be parsed
    #[error("invalid product spec: {0}")]
    InvalidProduct(String),

    /// `is:` quality is not one of different/tentative/optional
    #[error(r#"unknown "is" quality "{0}""#)]
    UnknownQuality(String),

    /// More `run_ids` than a single request may search
    #[error("too many runs in query: {requested} requested, at most {max} allowed")]
    TooManyRuns { requested: usize, max: usize },

    /// Diff filter letters are limited to `A`, `D`, `C` and `U`
    #[error("invalid diff filter character {0:?}")]
    InvalidDiffFilter(char),
}

impl QueryError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownFragment => "query.unknown_fragment",
            Self::MissingRunIds => "query.missing_run_ids",
            Self::InvalidStatus(_) => "query.invalid_status",
            Self::InvalidProduct(_) => "query.invalid_product",
            Self::UnknownQuality(_) => "query.unknown_quality",
            Self::TooManyRuns { .. } => "query.too_many_runs",
            Self::InvalidDiffFilter(_) => "query.invalid_diff_filter",
        }
    }
}

/// Memory monitor state machine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("monitor already running")]
    Running,

    #[error("monitor already stopped")]
    Stopped,

    /// Eviction fraction outside `[0, 1]`
    #[error("eviction fraction must be within [0, 1], got {0}")]
    InvalidFraction(f64),

    /// Check interval of zero would spin
    #[error("monitor interval must be greater than zero")]
    ZeroInterval,
}

impl MonitorError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Running => "monitor.running",
            Self::Stopped => "monitor.stopped",
            Self::InvalidFraction(_) => "monitor.invalid_fraction",
            Self::ZeroInterval => "monitor.zero_interval",
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFailed(String),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config value: {0}")]
    ValidationError(String),
}
