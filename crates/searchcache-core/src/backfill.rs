//! One-shot population of a fresh index.
//!
//! [`fill_index`] fetches as many recent runs as the byte budget allows,
//! starts the memory monitor, and ingests the runs newest first. Backfilling
//! stops as soon as the monitor evicts anything or is stopped; the run being
//! ingested at that moment may still complete.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;

use crate::error::{MonitorError, Result};
use crate::fetch::RunFetcher;
use crate::index::{IndexObserver, ShardedIndex};
use crate::monitor::{IndexMonitor, MonitorObserver};
use crate::run::RunId;

/// Average resident size of one ingested run.
pub const BYTES_PER_RUN: u64 = 65_000_000;

/// Number of runs that fit in `max_bytes`.
#[must_use]
pub fn run_budget(max_bytes: u64, bytes_per_run: u64) -> usize {
    if bytes_per_run == 0 {
        return 0;
    }
    usize::try_from(max_bytes / bytes_per_run).unwrap_or(usize::MAX)
}

/// Cleared by the first eviction or monitor stop.
#[derive(Debug)]
struct BackfillFlag {
    backfilling: AtomicBool,
}

impl BackfillFlag {
    fn halt(&self, reason: &'static str) {
        if self.backfilling.swap(false, Ordering::SeqCst) {
            tracing::info!(reason, "Backfill halting");
        }
    }

    fn is_set(&self) -> bool {
        self.backfilling.load(Ordering::SeqCst)
    }
}

impl IndexObserver for BackfillFlag {
    fn on_evicted(&self, _runs: &[RunId]) {
        self.halt("runs evicted");
    }
}

impl MonitorObserver for BackfillFlag {
    fn on_stopped(&self) {
        self.halt("monitor stopped");
    }
}

/// Outcome of a backfill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Runs returned by the fetcher.
    pub fetched: usize,
    pub ingested: usize,
    pub failed: usize,
    /// Stopped early because of memory pressure or a monitor stop.
    pub halted: bool,
}

/// A finished backfill and the monitor it left running.
#[derive(Debug)]
pub struct Backfill {
    pub summary: BackfillSummary,
    /// Resolves when the monitor stops.
    pub monitor: JoinHandle<std::result::Result<Infallible, MonitorError>>,
}

/// Fetches up to `budget` runs and ingests them newest first.
///
/// Per-run ingestion errors are logged and skipped. Only a failing fetch is
/// returned as an error, before the monitor is started.
pub async fn fill_index(
    fetcher: &dyn RunFetcher,
    index: &Arc<ShardedIndex>,
    monitor: &Arc<IndexMonitor>,
    budget: usize,
) -> Result<Backfill> {
    let mut runs = fetcher.fetch_runs(budget).await?;
    runs.sort_by(|a, b| b.time_start.cmp(&a.time_start));
    tracing::info!(runs = runs.len(), budget, "Backfilling index");

    let flag = Arc::new(BackfillFlag {
        backfilling: AtomicBool::new(true),
    });
    let index_observer: Arc<dyn IndexObserver> = flag.clone();
    let monitor_observer: Arc<dyn MonitorObserver> = flag.clone();
    index.add_observer(Arc::clone(&index_observer));
    monitor.add_observer(Arc::clone(&monitor_observer));

    let monitor_task = tokio::spawn({
        let monitor = Arc::clone(monitor);
        async move { monitor.start().await }
    });

    let mut summary = BackfillSummary {
        fetched: runs.len(),
        ..BackfillSummary::default()
    };
    for run in runs {
        if !flag.is_set() {
            tracing::info!(
                ingested = summary.ingested,
                remaining = summary.fetched - summary.ingested - summary.failed,
                "Backfilling halted mid-iteration"
            );
            summary.halted = true;
            break;
        }
        let run_id = run.id;
        match index.ingest_run(run).await {
            Ok(()) => summary.ingested += 1,
            Err(err) => {
                tracing::error!(run_id = %run_id, error = %err, code = err.code(), "Failed to ingest run during backfill");
                summary.failed += 1;
            }
        }
    }
    flag.backfilling.store(false, Ordering::SeqCst);
    index.remove_observer(&index_observer);
    monitor.remove_observer(&monitor_observer);

    tracing::info!(
        ingested = summary.ingested,
        failed = summary.failed,
        halted = summary.halted,
        "Backfill finished"
    );
    Ok(Backfill {
        summary,
        monitor: monitor_task,
    })
}
