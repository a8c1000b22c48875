//! searchcache-core: in-memory query engine for web-platform-tests results
//!
//! Holds the full results of recent test runs in a sharded index and answers
//! structured search queries over them.
//!
//! # Architecture
//!
//! ```text
//! RunFetcher ─→ Backfill / Poll ─→ ShardedIndex ←─ IndexMonitor (evicts)
//!                                      ↓
//!  query JSON ─→ AbstractQuery ─→ Binder ─→ ConcreteQuery ─→ Plan ─→ SearchResult
//! ```
//!
//! # Modules
//!
//! - `run`, `status`: run metadata, product specs and status codes
//! - `registry`, `results`: fingerprinted test names and per-run result stores
//! - `report`: wptreport documents and their loaders
//! - `metadata`: triage metadata and web-features caches
//! - `query`: abstract and concrete queries, parsing and binding
//! - `index`: the sharded index (ingest, evict, bind)
//! - `filter`, `aggregator`: plan execution and per-test result rows
//! - `monitor`: heap-budget monitor
//! - `fetch`, `backfill`, `poll`: ingestion pipelines
//! - `config`, `logging`: configuration and structured logging
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod backfill;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod index;
pub mod logging;
pub mod metadata;
pub mod monitor;
pub mod poll;
pub mod query;
pub mod registry;
pub mod report;
pub mod results;
pub mod run;
pub mod status;

pub use aggregator::{AggregationOpts, DiffFilter, RunSummary, SearchResult, TestDiff};
pub use error::{Error, Result};
pub use filter::{CancelToken, Plan};
pub use index::{IndexObserver, ShardedIndex};
pub use monitor::{IndexMonitor, MonitorSettings, ProcessRuntime, Runtime};
pub use query::{AbstractQuery, Binder, ConcreteQuery, RunQuery};
pub use run::{ProductSpec, RunId, TestRun};
pub use status::TestStatus;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
