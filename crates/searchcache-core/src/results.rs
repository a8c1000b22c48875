//! Per-run result storage.
//!
//! [`RunResults`] is one run's sparse `fingerprint -> status` map for a single
//! shard; [`ResultStore`] holds the `RunResults` of every resident run for that
//! shard. Stores are published behind `Arc` so a bound query keeps reading a
//! run's data even while the run is evicted underneath it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::registry::TestFingerprint;
use crate::run::RunId;
use crate::status::TestStatus;

/// One run's results within one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResults {
    by_test: HashMap<TestFingerprint, TestStatus>,
}

impl RunResults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fingerprint: TestFingerprint, status: TestStatus) {
        self.by_test.insert(fingerprint, status);
    }

    /// Status of `fingerprint`, or `Unknown` when the run has no result for it.
    #[must_use]
    pub fn get(&self, fingerprint: TestFingerprint) -> TestStatus {
        self.by_test
            .get(&fingerprint)
            .copied()
            .unwrap_or(TestStatus::Unknown)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_test.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_test.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TestFingerprint, TestStatus)> + '_ {
        self.by_test.iter().map(|(fp, status)| (*fp, *status))
    }
}

impl FromIterator<(TestFingerprint, TestStatus)> for RunResults {
    fn from_iter<I: IntoIterator<Item = (TestFingerprint, TestStatus)>>(iter: I) -> Self {
        Self {
            by_test: iter.into_iter().collect(),
        }
    }
}

/// `RunId -> RunResults` for one shard.
#[derive(Debug, Default)]
pub struct ResultStore {
    by_run: HashMap<RunId, Arc<RunResults>>,
}

impl ResultStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, run: RunId, results: RunResults) -> Result<()> {
        if self.by_run.contains_key(&run) {
            return Err(Error::RunExists(run));
        }
        self.by_run.insert(run, Arc::new(results));
        Ok(())
    }

    pub fn remove(&mut self, run: RunId) -> Result<Arc<RunResults>> {
        self.by_run.remove(&run).ok_or(Error::UnknownRun(run))
    }

    #[must_use]
    pub fn for_run(&self, run: RunId) -> Option<Arc<RunResults>> {
        self.by_run.get(&run).cloned()
    }

    #[must_use]
    pub fn contains(&self, run: RunId) -> bool {
        self.by_run.contains_key(&run)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_run.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_run.is_empty()
    }
}
