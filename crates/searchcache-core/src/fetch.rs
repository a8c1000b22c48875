//! Run listing collaborators used by backfill and polling.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::run::TestRun;

/// Lists the most recently started runs.
#[async_trait]
pub trait RunFetcher: Send + Sync {
    /// Returns at most `limit` runs, most recent first.
    async fn fetch_runs(&self, limit: usize) -> Result<Vec<TestRun>>;
}

/// Queries the dashboard's `/api/runs` endpoint.
#[derive(Debug, Clone)]
pub struct HttpRunFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRunFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn runs_url(&self, limit: usize) -> String {
        format!("{}/api/runs?max-count={limit}", self.base_url)
    }
}

#[async_trait]
impl RunFetcher for HttpRunFetcher {
    async fn fetch_runs(&self, limit: usize) -> Result<Vec<TestRun>> {
        let url = self.runs_url(limit);
        tracing::debug!(%url, limit, "Fetching runs");
        let mut runs = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<TestRun>>()
            .await?;
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Serves a fixed run list, newest first.
#[derive(Debug, Default)]
pub struct InMemoryRunFetcher {
    runs: RwLock<Vec<TestRun>>,
}

impl InMemoryRunFetcher {
    #[must_use]
    pub fn new(runs: Vec<TestRun>) -> Self {
        Self {
            runs: RwLock::new(runs),
        }
    }

    /// Adds a run that subsequent fetches will see first.
    pub fn push_newest(&self, run: TestRun) {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, run);
    }
}

#[async_trait]
impl RunFetcher for InMemoryRunFetcher {
    async fn fetch_runs(&self, limit: usize) -> Result<Vec<TestRun>> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.iter().take(limit).cloned().collect())
    }
}
