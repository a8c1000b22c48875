//! Steady-state refresh loops.
//!
//! Each loop runs until its shutdown flag is set. Loops are paced by a tokio
//! interval, so slow iterations eat into the wait rather than extending it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::fetch::RunFetcher;
use crate::index::ShardedIndex;
use crate::metadata::{MetadataCache, MetadataSource, WebFeaturesCache, WebFeaturesSource};

/// Counts for one poll iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollIteration {
    pub fetched: usize,
    pub ingested: usize,
    /// Already resident or already loading.
    pub skipped: usize,
    pub failed: usize,
    /// Position of the first run ingested after an older-listed run was not,
    /// which means the fetcher's ordering has a hole in it.
    pub ingested_after: Option<usize>,
}

/// Fetches up to `max_runs` recent runs and ingests any that are new.
pub async fn poll_once(fetcher: &dyn RunFetcher, index: &ShardedIndex, max_runs: usize) -> PollIteration {
    let runs = match fetcher.fetch_runs(max_runs).await {
        Ok(runs) => runs,
        Err(err) => {
            tracing::error!(error = %err, code = err.code(), "Failed to fetch runs");
            return PollIteration::default();
        }
    };
    if runs.is_empty() {
        tracing::error!("Fetcher produced no runs for update");
        return PollIteration::default();
    }

    let mut iteration = PollIteration {
        fetched: runs.len(),
        ..PollIteration::default()
    };
    let mut errors: Vec<String> = Vec::new();
    let mut previous_ingested = true;
    for (position, run) in runs.into_iter().enumerate() {
        let run_id = run.id;
        let ingested = match index.ingest_run(run).await {
            Ok(()) => {
                iteration.ingested += 1;
                true
            }
            Err(err) if err.is_expected_ingest_skip() => {
                tracing::info!(run_id = %run_id, reason = %err, "Skipping run");
                iteration.skipped += 1;
                errors.push(format!("{run_id}: {err}"));
                false
            }
            Err(err) => {
                tracing::error!(run_id = %run_id, error = %err, code = err.code(), "Failed to ingest run");
                iteration.failed += 1;
                errors.push(format!("{run_id}: {err}"));
                false
            }
        };
        if ingested && !previous_ingested && iteration.ingested_after.is_none() {
            iteration.ingested_after = Some(position);
        }
        previous_ingested = ingested;
    }

    if let Some(skipped) = iteration.ingested_after {
        tracing::error!(skipped, errors = ?errors, "Ingested run after skipping runs");
    }
    iteration
}

/// Keeps `index` current with the newest runs.
///
/// Waits one `interval` before the first iteration so that it does not
/// overlap a backfill started at the same time.
pub async fn keep_runs_updated(
    fetcher: Arc<dyn RunFetcher>,
    index: Arc<ShardedIndex>,
    interval: Duration,
    max_runs: usize,
    shutdown_flag: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_update: DateTime<Utc> = Utc::now();

    loop {
        ticker.tick().await;
        if shutdown_flag.load(Ordering::SeqCst) {
            tracing::info!("Run poller: shutdown signal received");
            break;
        }

        let started = Instant::now();
        let iteration = poll_once(fetcher.as_ref(), &index, max_runs).await;
        if iteration.ingested > 0 {
            last_update = Utc::now();
        } else {
            tracing::warn!(
                last_update = %last_update.to_rfc3339(),
                fetched = iteration.fetched,
                "No new runs ingested"
            );
        }
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ingested = iteration.ingested,
            skipped = iteration.skipped,
            failed = iteration.failed,
            "Run poll iteration complete"
        );
    }
}

/// Refreshes `cache` from `source` immediately and then every `interval`.
/// A failed fetch keeps the previous table.
pub async fn keep_metadata_updated(
    source: Arc<dyn MetadataSource>,
    cache: Arc<MetadataCache>,
    interval: Duration,
    shutdown_flag: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }
        match source.fetch_metadata().await {
            Ok(table) => {
                tracing::debug!(paths = table.len(), "Metadata cache refreshed");
                cache.set(table);
            }
            Err(err) => tracing::warn!(error = %err, "Failed to refresh metadata"),
        }
    }
}

/// Refreshes `cache` from `source` immediately and then every `interval`.
pub async fn keep_web_features_updated(
    source: Arc<dyn WebFeaturesSource>,
    cache: Arc<WebFeaturesCache>,
    interval: Duration,
    shutdown_flag: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }
        match source.fetch_web_features().await {
            Ok(data) => {
                tracing::debug!(tests = data.len(), "Web features cache refreshed");
                cache.set(data);
            }
            Err(err) => tracing::warn!(error = %err, "Failed to refresh web features"),
        }
    }
}
