//! Sharded in-memory index of run results.
//!
//! Fingerprints are partitioned across shards by `test_hash % shards`; each
//! shard owns a [`TestRegistry`] and a [`ResultStore`]. The index-level state
//! (resident runs, in-flight loads) sits behind one `RwLock` that is held for
//! writing while a loaded run is published to every shard, and for reading
//! while a query binds. A bind therefore sees either all of a run or none
//! of it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::filter::{Filter, Plan, ShardFilter};
use crate::query::ConcreteQuery;
use crate::registry::{TestFingerprint, TestRegistry, compute_fingerprint};
use crate::report::{ReportLoader, TestResultsReport};
use crate::results::{ResultStore, RunResults};
use crate::run::{RunId, TestRun};
use crate::status::TestStatus;

/// Notified after the index changes. Callbacks run outside the index locks.
pub trait IndexObserver: Send + Sync {
    fn on_ingested(&self, _run: &TestRun) {}
    fn on_evicted(&self, _runs: &[RunId]) {}
}

#[repr(align(128))]
struct Shard {
    registry: Arc<RwLock<TestRegistry>>,
    results: RwLock<ResultStore>,
}

impl Shard {
    fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(TestRegistry::new())),
            results: RwLock::new(ResultStore::new()),
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tests = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let runs = self
            .results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Shard")
            .field("tests", &tests)
            .field("runs", &runs)
            .finish()
    }
}

#[derive(Debug, Default)]
struct IndexState {
    runs: HashMap<RunId, TestRun>,
    in_flight: HashSet<RunId>,
}

/// One fingerprint's data staged for a shard.
struct Staged<'r> {
    name: &'r str,
    subtest: Option<&'r str>,
    status: TestStatus,
}

/// Sharded index over resident runs.
pub struct ShardedIndex {
    loader: Arc<dyn ReportLoader>,
    shards: Box<[Shard]>,
    state: RwLock<IndexState>,
    observers: RwLock<Vec<Arc<dyn IndexObserver>>>,
}

impl std::fmt::Debug for ShardedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedIndex")
            .field("shards", &self.shards)
            .field("runs", &self.len())
            .finish_non_exhaustive()
    }
}

/// Clears a run's in-flight mark when ingestion ends, however it ends.
struct InFlightGuard<'a> {
    index: &'a ShardedIndex,
    run: RunId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.index.write_state().in_flight.remove(&self.run);
    }
}

impl ShardedIndex {
    /// Create an index with `shards` partitions.
    pub fn new(loader: Arc<dyn ReportLoader>, shards: usize) -> Result<Self> {
        if shards == 0 {
            return Err(Error::SomeShardsRequired);
        }
        Ok(Self {
            loader,
            shards: (0..shards).map(|_| Shard::new()).collect(),
            state: RwLock::new(IndexState::default()),
            observers: RwLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of resident runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_state().runs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_state().runs.is_empty()
    }

    /// Number of distinct fingerprints ever ingested.
    #[must_use]
    pub fn fingerprint_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .registry
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
            .sum()
    }

    pub fn add_observer(&self, observer: Arc<dyn IndexObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Unregisters an observer added with [`add_observer`](Self::add_observer).
    /// Returns whether it was registered.
    pub fn remove_observer(&self, observer: &Arc<dyn IndexObserver>) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|existing| !Arc::ptr_eq(existing, observer));
        observers.len() != before
    }

    fn observers(&self) -> Vec<Arc<dyn IndexObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Run metadata
    // -------------------------------------------------------------------------

    /// Metadata for a resident run.
    pub fn run(&self, id: RunId) -> Result<TestRun> {
        self.read_state()
            .runs
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownRun(id))
    }

    /// Metadata for several resident runs, in request order. Fails on the
    /// first id that is not resident.
    pub fn runs(&self, ids: &[RunId]) -> Result<Vec<TestRun>> {
        let state = self.read_state();
        ids.iter()
            .map(|id| state.runs.get(id).cloned().ok_or(Error::UnknownRun(*id)))
            .collect()
    }

    /// Splits `ids` into resident runs and ids that still need loading.
    #[must_use]
    pub fn split_resident(&self, ids: &[RunId]) -> (Vec<TestRun>, Vec<RunId>) {
        let state = self.read_state();
        let mut resident = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            match state.runs.get(id) {
                Some(run) => resident.push(run.clone()),
                None => missing.push(*id),
            }
        }
        (resident, missing)
    }

    /// Every resident run, newest first.
    #[must_use]
    pub fn resident_runs(&self) -> Vec<TestRun> {
        let mut runs: Vec<TestRun> = self.read_state().runs.values().cloned().collect();
        runs.sort_by(|a, b| b.time_start.cmp(&a.time_start).then(b.id.cmp(&a.id)));
        runs
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Loads `run`'s report and publishes its results.
    ///
    /// Fails with [`Error::RunExists`] when the run is resident and
    /// [`Error::RunLoading`] when another caller is loading it. Nothing is
    /// visible to [`bind`](Self::bind) until the whole run is stored.
    pub async fn ingest_run(&self, run: TestRun) -> Result<()> {
        if run.id.is_nil() {
            return Err(Error::NilRun);
        }
        let _in_flight = self.mark_in_flight(run.id)?;

        let report = self.loader.load(&run).await?;
        let staged = self.stage(&report)?;
        let fingerprints: usize = staged.iter().map(HashMap::len).sum();
        self.store(&run, staged)?;

        tracing::info!(
            run_id = %run.id,
            browser = %run.browser_name,
            tests = report.results.len(),
            fingerprints,
            "Ingested run"
        );
        for observer in self.observers() {
            observer.on_ingested(&run);
        }
        Ok(())
    }

    fn mark_in_flight(&self, id: RunId) -> Result<InFlightGuard<'_>> {
        let mut state = self.write_state();
        if state.runs.contains_key(&id) {
            return Err(Error::RunExists(id));
        }
        if !state.in_flight.insert(id) {
            return Err(Error::RunLoading(id));
        }
        Ok(InFlightGuard {
            index: self,
            run: id,
        })
    }

    /// Computes fingerprints and groups the report's results by shard.
    fn stage<'r>(
        &self,
        report: &'r TestResultsReport,
    ) -> Result<Vec<HashMap<TestFingerprint, Staged<'r>>>> {
        let shard_count = self.shards.len();
        let mut staged: Vec<HashMap<TestFingerprint, Staged<'r>>> =
            (0..shard_count).map(|_| HashMap::new()).collect();

        for result in &report.results {
            let test = compute_fingerprint(&result.test, None)?;
            let shard = &mut staged[test.shard(shard_count)];
            shard.insert(
                test,
                Staged {
                    name: &result.test,
                    subtest: None,
                    status: result.status,
                },
            );

            let mut seen = HashSet::with_capacity(result.subtests.len());
            for sub in &result.subtests {
                if !seen.insert(sub.name.as_str()) {
                    tracing::warn!(
                        test = %result.test,
                        subtest = %sub.name,
                        "Duplicate subtests with the same name"
                    );
                    continue;
                }
                let fingerprint = compute_fingerprint(&result.test, Some(&sub.name))?;
                shard.insert(
                    fingerprint,
                    Staged {
                        name: &result.test,
                        subtest: Some(&sub.name),
                        status: sub.status,
                    },
                );
            }
        }
        Ok(staged)
    }

    fn store(&self, run: &TestRun, staged: Vec<HashMap<TestFingerprint, Staged<'_>>>) -> Result<()> {
        let mut state = self.write_state();
        if state.runs.contains_key(&run.id) {
            return Err(Error::RunExists(run.id));
        }
        for (shard, data) in self.shards.iter().zip(staged) {
            let mut registry = shard.registry.write().unwrap_or_else(PoisonError::into_inner);
            let mut results = RunResults::new();
            for (fingerprint, entry) in data {
                registry.insert(fingerprint, entry.name, entry.subtest);
                results.insert(fingerprint, entry.status);
            }
            shard
                .results
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .add(run.id, results)?;
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    /// Evicts the oldest `fraction` of resident runs, at least one.
    ///
    /// `fraction` is clamped to `[0, 1]`; NaN counts as 0. An empty index
    /// evicts nothing and reports 0.
    pub fn evict_runs(&self, fraction: f64) -> Result<usize> {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let evicted = {
            let mut state = self.write_state();
            let resident = state.runs.len();
            if resident == 0 {
                return Ok(0);
            }
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            let count = ((resident as f64 * fraction).floor() as usize).max(1);
            self.evict_oldest(&mut state, count)?
        };
        self.notify_evicted(&evicted);
        Ok(evicted.len())
    }

    /// Evicts exactly the oldest resident run.
    pub fn evict_any_run(&self) -> Result<RunId> {
        let evicted = {
            let mut state = self.write_state();
            if state.runs.is_empty() {
                return Err(Error::NoRuns);
            }
            self.evict_oldest(&mut state, 1)?
        };
        self.notify_evicted(&evicted);
        evicted.first().copied().ok_or(Error::NoRuns)
    }

    fn evict_oldest(&self, state: &mut IndexState, count: usize) -> Result<Vec<RunId>> {
        let mut by_age: Vec<&TestRun> = state.runs.values().collect();
        by_age.sort_by(|a, b| a.time_start.cmp(&b.time_start).then(a.id.cmp(&b.id)));
        let victims: Vec<RunId> = by_age.iter().take(count).map(|run| run.id).collect();

        for shard in &*self.shards {
            let mut results = shard.results.write().unwrap_or_else(PoisonError::into_inner);
            for id in &victims {
                results.remove(*id)?;
            }
        }
        for id in &victims {
            state.runs.remove(id);
        }
        Ok(victims)
    }

    fn notify_evicted(&self, evicted: &[RunId]) {
        tracing::info!(evicted = evicted.len(), runs = ?evicted, "Evicted runs");
        for observer in self.observers() {
            observer.on_evicted(evicted);
        }
    }

    // -------------------------------------------------------------------------
    // Query binding
    // -------------------------------------------------------------------------

    /// Compiles `query` over `runs` into an executable plan.
    ///
    /// Every run in `runs`, and every run the query references, must be
    /// resident at bind time.
    pub fn bind(&self, runs: &[TestRun], query: Option<&ConcreteQuery>) -> Result<Plan> {
        if runs.is_empty() {
            return Err(Error::NoRuns);
        }
        let query = query.ok_or(Error::NoQuery)?;

        let run_ids: Vec<RunId> = runs.iter().map(|run| run.id).collect();
        let state = self.read_state();
        let referenced = query.run_ids();
        if let Some(missing) = run_ids
            .iter()
            .chain(referenced.iter())
            .find(|id| !state.runs.contains_key(*id))
        {
            return Err(Error::UnknownRun(*missing));
        }

        let mut shards = Vec::with_capacity(self.shards.len());
        for shard in &*self.shards {
            let store = shard.results.read().unwrap_or_else(PoisonError::into_inner);
            let results: HashMap<RunId, Arc<RunResults>> = run_ids
                .iter()
                .chain(referenced.iter())
                .map(|id| {
                    store
                        .for_run(*id)
                        .map(|r| (*id, r))
                        .ok_or(Error::UnknownRun(*id))
                })
                .collect::<Result<_>>()?;
            let ordered: Vec<Arc<RunResults>> = run_ids
                .iter()
                .filter_map(|id| results.get(id).cloned())
                .collect();
            let filter = Filter::compile(query, &results, &ordered)?;
            shards.push(ShardFilter {
                registry: Arc::clone(&shard.registry),
                results,
                filter,
            });
        }
        drop(state);

        tracing::debug!(runs = run_ids.len(), atoms = query.size(), "Bound query plan");
        Ok(Plan::new(run_ids, shards))
    }
}
