//! Reduction of matched fingerprints into per-test result rows.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::registry::{TestFingerprint, TestName};
use crate::results::RunResults;
use crate::status::TestStatus;

/// Options controlling row contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationOpts {
    /// Collect the names of matched subtests on each row.
    pub include_subtests: bool,
    /// Add a histogram of how many runs pass each matched fingerprint.
    pub interop_format: bool,
    /// A top-level `OK` (harness completed) contributes nothing to a run's
    /// counts.
    pub ignore_harness_result: bool,
    /// Compare the first run against the second. Only applies when exactly
    /// two runs are queried.
    pub include_diff: bool,
    pub diff_filter: DiffFilter,
}

/// Which kinds of change a diff counts, after git's `--diff-filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffFilter {
    /// Present only in the second run.
    pub added: bool,
    /// Present only in the first run.
    pub deleted: bool,
    /// Present in both with a different pass/fail outcome.
    pub changed: bool,
    /// Keep diffs that came out empty.
    pub unchanged: bool,
}

impl Default for DiffFilter {
    fn default() -> Self {
        Self {
            added: true,
            deleted: true,
            changed: true,
            unchanged: false,
        }
    }
}

impl FromStr for DiffFilter {
    type Err = QueryError;

    /// Parses letters such as `"ACU"`. The empty string selects the default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let mut filter = Self {
            added: false,
            deleted: false,
            changed: false,
            unchanged: false,
        };
        for c in s.chars() {
            match c {
                'A' => filter.added = true,
                'D' => filter.deleted = true,
                'C' => filter.changed = true,
                'U' => filter.unchanged = true,
                other => return Err(QueryError::InvalidDiffFilter(other)),
            }
        }
        Ok(filter)
    }
}

/// Differences between two runs over a test's fingerprints. Serialized as
/// `[newly_passing, regressions, total_delta]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 3]", into = "[i32; 3]")]
pub struct TestDiff {
    pub newly_passing: i32,
    pub regressions: i32,
    pub total_delta: i32,
}

impl From<[i32; 3]> for TestDiff {
    fn from([newly_passing, regressions, total_delta]: [i32; 3]) -> Self {
        Self {
            newly_passing,
            regressions,
            total_delta,
        }
    }
}

impl From<TestDiff> for [i32; 3] {
    fn from(diff: TestDiff) -> Self {
        [diff.newly_passing, diff.regressions, diff.total_delta]
    }
}

impl TestDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Accounts for one fingerprint going from `before` to `after`.
    pub fn append(&mut self, before: TestStatus, after: TestStatus, filter: &DiffFilter) {
        match (before, after) {
            (TestStatus::Unknown, TestStatus::Unknown) => {}
            (TestStatus::Unknown, added) => {
                if !filter.added {
                    return;
                }
                if added.is_pass_or_ok() {
                    self.newly_passing += 1;
                } else {
                    self.regressions += 1;
                }
            }
            (_, TestStatus::Unknown) => {
                if filter.deleted {
                    self.total_delta -= 1;
                }
            }
            (before, after) => {
                let was_passing = before.is_pass_or_ok();
                if was_passing == after.is_pass_or_ok() || !filter.changed {
                    return;
                }
                if was_passing {
                    self.regressions += 1;
                } else {
                    self.newly_passing += 1;
                }
            }
        }
    }
}

/// Pass/total counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub passes: u32,
    pub total: u32,
}

/// One matched test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub test: String,
    /// One entry per queried run, in query order.
    #[serde(rename = "legacy_status")]
    pub per_run: Vec<RunSummary>,
    /// `interop[k]` counts matched fingerprints passing in exactly `k` runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interop: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subtests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<TestDiff>,
}

/// Accumulates rows for one shard. Rows are keyed by test hash, and all
/// fingerprints of a test live in the same shard, so per-shard outputs never
/// overlap.
pub(crate) struct Aggregator<'a> {
    runs: &'a [Arc<RunResults>],
    opts: AggregationOpts,
    rows: HashMap<u64, SearchResult>,
}

impl<'a> Aggregator<'a> {
    pub(crate) fn new(runs: &'a [Arc<RunResults>], opts: AggregationOpts) -> Self {
        Self {
            runs,
            opts,
            rows: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, fingerprint: TestFingerprint, name: &TestName) {
        let run_count = self.runs.len();
        let row = self
            .rows
            .entry(fingerprint.test_hash)
            .or_insert_with(|| SearchResult {
                test: name.name.to_string(),
                per_run: vec![RunSummary::default(); run_count],
                interop: None,
                subtests: Vec::new(),
                diff: None,
            });

        let statuses = self.runs.iter().map(|results| results.get(fingerprint));
        let mut passing = 0;
        for (summary, status) in row.per_run.iter_mut().zip(statuses) {
            if status == TestStatus::Unknown {
                continue;
            }
            if self.opts.ignore_harness_result
                && !fingerprint.is_subtest()
                && status == TestStatus::Ok
            {
                continue;
            }
            summary.total += 1;
            if status.is_pass_or_ok() {
                summary.passes += 1;
                passing += 1;
            }
        }

        if self.opts.interop_format {
            let histogram = row.interop.get_or_insert_with(|| vec![0; run_count + 1]);
            histogram[passing] += 1;
        }
        if self.opts.include_subtests {
            if let Some(subtest) = &name.subtest {
                row.subtests.push(subtest.to_string());
            }
        }
        if self.opts.include_diff {
            if let [before, after] = self.runs {
                row.diff.get_or_insert_with(TestDiff::default).append(
                    before.get(fingerprint),
                    after.get(fingerprint),
                    &self.opts.diff_filter,
                );
            }
        }
    }

    pub(crate) fn finish(self) -> Vec<SearchResult> {
        let keep_empty_diffs = self.opts.diff_filter.unchanged;
        self.rows
            .into_values()
            .map(|mut row| {
                row.subtests.sort_unstable();
                if !keep_empty_diffs && row.diff.is_some_and(|diff| diff.is_empty()) {
                    row.diff = None;
                }
                row
            })
            .collect()
    }
}
