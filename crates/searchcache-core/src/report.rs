//! Run result reports and the loaders that fetch them.
//!
//! A report is the `wptreport` JSON document uploaded for a run: an ordered
//! list of top-level test results, each with optional subtest results.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::run::{RunId, TestRun};
use crate::status::TestStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResultsReport {
    pub results: Vec<TestResult>,
    pub run_info: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResult {
    pub test: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub subtests: Vec<SubtestResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtestResult {
    pub name: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestResult {
    #[must_use]
    pub fn new(test: impl Into<String>, status: TestStatus) -> Self {
        Self {
            test: test.into(),
            status,
            message: None,
            subtests: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_subtest(mut self, name: impl Into<String>, status: TestStatus) -> Self {
        self.subtests.push(SubtestResult {
            name: name.into(),
            status,
            message: None,
        });
        self
    }
}

impl TestResultsReport {
    #[must_use]
    pub fn new(results: Vec<TestResult>) -> Self {
        Self {
            results,
            run_info: serde_json::Value::Null,
        }
    }
}

/// Loads the full results report for a run.
#[async_trait]
pub trait ReportLoader: Send + Sync {
    async fn load(&self, run: &TestRun) -> Result<TestResultsReport>;
}

/// Fetches reports from the run's `raw_results_url`.
#[derive(Debug, Clone, Default)]
pub struct HttpReportLoader {
    client: reqwest::Client,
}

impl HttpReportLoader {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReportLoader for HttpReportLoader {
    async fn load(&self, run: &TestRun) -> Result<TestResultsReport> {
        if run.raw_results_url.is_empty() {
            return Err(Error::Load {
                run: run.id,
                reason: "run has no raw_results_url".to_string(),
            });
        }
        tracing::debug!(run_id = %run.id, url = %run.raw_results_url, "Fetching run report");
        let report = self
            .client
            .get(&run.raw_results_url)
            .send()
            .await?
            .error_for_status()?
            .json::<TestResultsReport>()
            .await?;
        Ok(report)
    }
}

/// Serves reports registered up front, keyed by run id.
#[derive(Debug, Default)]
pub struct InMemoryReportLoader {
    reports: RwLock<HashMap<RunId, TestResultsReport>>,
}

impl InMemoryReportLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: RunId, report: TestResultsReport) {
        self.reports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run, report);
    }
}

#[async_trait]
impl ReportLoader for InMemoryReportLoader {
    async fn load(&self, run: &TestRun) -> Result<TestResultsReport> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run.id)
            .cloned()
            .ok_or_else(|| Error::Load {
                run: run.id,
                reason: "no report registered".to_string(),
            })
    }
}
