//! Shared fixtures for searchcache-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use searchcache_core::report::{InMemoryReportLoader, TestResult, TestResultsReport};
use searchcache_core::{RunId, ShardedIndex, TestRun, TestStatus};

/// `2024-01-01T00:00:00Z` plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

pub fn run(id: i64, browser: &str, minutes: i64) -> TestRun {
    TestRun::new(id, browser).with_start(at(minutes))
}

/// Report with top-level results only.
pub fn flat_report(results: &[(&str, TestStatus)]) -> TestResultsReport {
    TestResultsReport::new(
        results
            .iter()
            .map(|(test, status)| TestResult::new(*test, *status))
            .collect(),
    )
}

/// A test with a harness status and subtests.
pub fn with_subtests(test: &str, status: TestStatus, subtests: &[(&str, TestStatus)]) -> TestResult {
    subtests
        .iter()
        .fold(TestResult::new(test, status), |result, (name, status)| {
            result.with_subtest(*name, *status)
        })
}

pub fn loader(reports: Vec<(i64, TestResultsReport)>) -> Arc<InMemoryReportLoader> {
    let loader = InMemoryReportLoader::new();
    for (id, report) in reports {
        loader.insert(RunId(id), report);
    }
    Arc::new(loader)
}

/// Builds an index over `shards` shards and ingests every run.
pub async fn index_with(shards: usize, runs: &[(TestRun, TestResultsReport)]) -> Arc<ShardedIndex> {
    let loader = loader(
        runs.iter()
            .map(|(run, report)| (run.id.0, report.clone()))
            .collect(),
    );
    let index = Arc::new(ShardedIndex::new(loader, shards).unwrap());
    for (run, _) in runs {
        index.ingest_run(run.clone()).await.unwrap();
    }
    index
}

pub fn test_names(rows: &[searchcache_core::SearchResult]) -> Vec<&str> {
    rows.iter().map(|row| row.test.as_str()).collect()
}
