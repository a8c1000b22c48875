//! Filter engine: concrete queries compiled against shard data.
//!
//! [`ShardedIndex::bind`](crate::index::ShardedIndex::bind) produces a
//! [`Plan`] holding one compiled [`Filter`] per shard. Executing the plan
//! scans every shard in parallel on the rayon pool, evaluates the filter per
//! fingerprint and reduces matches through the aggregator. Shards partition
//! the fingerprint space, so the fan-in is a plain concatenation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::aggregator::{AggregationOpts, Aggregator, SearchResult};
use crate::error::{Error, Result};
use crate::metadata::{PathValues, WebFeaturesData, test_has_feature};
use crate::query::{ConcreteQuery, MetadataQuality};
use crate::registry::{TestFingerprint, TestName, TestRegistry};
use crate::results::RunResults;
use crate::run::{RunId, TestRun};
use crate::status::TestStatus;

/// Fingerprints scanned between cancellation checks.
const CANCEL_CHECK_STRIDE: usize = 1024;

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation for [`Plan::execute_with`].
///
/// Clones share the cancel flag. A deadline, when set, cancels the scan once
/// passed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled("query cancelled".to_string()));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::Cancelled("query deadline exceeded".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Filter
// =============================================================================

/// A concrete query bound to one shard's run results. Pattern strings are
/// stored lowercased.
#[derive(Debug, Clone)]
pub(crate) enum Filter {
    True,
    False,
    TestNamePattern(String),
    SubtestNamePattern(String),
    TestPath(String),
    RunStatusEq(Arc<RunResults>, TestStatus),
    RunStatusNeq(Arc<RunResults>, TestStatus),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Count(usize, Vec<Filter>),
    MoreThan(usize, Vec<Filter>),
    LessThan(usize, Vec<Filter>),
    Link(String, Arc<PathValues>),
    Triaged(Arc<RunResults>, Arc<PathValues>),
    TestLabel(String, Arc<PathValues>),
    WebFeature(String, Arc<WebFeaturesData>),
    Different(Vec<Arc<RunResults>>),
    Tentative,
    Optional,
}

impl Filter {
    /// Compiles `query` against `results`. `ordered` lists the plan's runs
    /// for atoms that compare across runs.
    pub(crate) fn compile(
        query: &ConcreteQuery,
        results: &HashMap<RunId, Arc<RunResults>>,
        ordered: &[Arc<RunResults>],
    ) -> Result<Self> {
        let run = |id: &RunId| results.get(id).cloned().ok_or(Error::UnknownRun(*id));
        let all = |args: &[ConcreteQuery]| {
            args.iter()
                .map(|arg| Self::compile(arg, results, ordered))
                .collect::<Result<Vec<_>>>()
        };
        Ok(match query {
            ConcreteQuery::True => Self::True,
            ConcreteQuery::False => Self::False,
            ConcreteQuery::TestNamePattern { pattern } => {
                Self::TestNamePattern(pattern.to_lowercase())
            }
            ConcreteQuery::SubtestNamePattern { subtest } => {
                Self::SubtestNamePattern(subtest.to_lowercase())
            }
            ConcreteQuery::TestPath { path } => Self::TestPath(path.to_lowercase()),
            ConcreteQuery::RunTestStatusEq { run: id, status } => {
                Self::RunStatusEq(run(id)?, *status)
            }
            ConcreteQuery::RunTestStatusNeq { run: id, status } => {
                Self::RunStatusNeq(run(id)?, *status)
            }
            ConcreteQuery::And(args) => Self::And(all(args)?),
            ConcreteQuery::Or(args) => Self::Or(all(args)?),
            ConcreteQuery::Not(arg) => Self::Not(Box::new(Self::compile(arg, results, ordered)?)),
            ConcreteQuery::Count { count, args } => Self::Count(*count, all(args)?),
            ConcreteQuery::MoreThan { count, args } => Self::MoreThan(*count, all(args)?),
            ConcreteQuery::LessThan { count, args } => Self::LessThan(*count, all(args)?),
            ConcreteQuery::Link { pattern, metadata } => {
                Self::Link(pattern.to_lowercase(), Arc::clone(metadata))
            }
            ConcreteQuery::Triaged { run: id, metadata } => {
                Self::Triaged(run(id)?, Arc::clone(metadata))
            }
            ConcreteQuery::TestLabel { label, metadata } => {
                Self::TestLabel(label.to_lowercase(), Arc::clone(metadata))
            }
            ConcreteQuery::TestWebFeature { feature, data } => {
                Self::WebFeature(feature.clone(), Arc::clone(data))
            }
            ConcreteQuery::MetadataQuality(MetadataQuality::Different) => {
                Self::Different(ordered.to_vec())
            }
            ConcreteQuery::MetadataQuality(MetadataQuality::Tentative) => Self::Tentative,
            ConcreteQuery::MetadataQuality(MetadataQuality::Optional) => Self::Optional,
        })
    }

    pub(crate) fn matches(&self, fingerprint: TestFingerprint, name: &TestName) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::TestNamePattern(pattern) => name.name.to_lowercase().contains(pattern.as_str()),
            Self::SubtestNamePattern(pattern) => name
                .subtest
                .as_deref()
                .is_some_and(|sub| sub.to_lowercase().contains(pattern.as_str())),
            Self::TestPath(path) => name.name.to_lowercase().starts_with(path.as_str()),
            Self::RunStatusEq(results, status) => results.get(fingerprint) == *status,
            Self::RunStatusNeq(results, status) => results.get(fingerprint) != *status,
            Self::And(args) => args.iter().all(|f| f.matches(fingerprint, name)),
            Self::Or(args) => args.iter().any(|f| f.matches(fingerprint, name)),
            Self::Not(arg) => !arg.matches(fingerprint, name),
            Self::Count(count, args) => Self::count(args, fingerprint, name) == *count,
            Self::MoreThan(count, args) => Self::count(args, fingerprint, name) > *count,
            Self::LessThan(count, args) => Self::count(args, fingerprint, name) < *count,
            Self::Link(pattern, metadata) => metadata
                .any_value(&name.name, |url| url.to_lowercase().contains(pattern.as_str())),
            Self::Triaged(results, metadata) => {
                results.get(fingerprint) != TestStatus::Unknown
                    && !metadata.values_for(&name.name).is_empty()
            }
            Self::TestLabel(label, metadata) => {
                metadata.any_value(&name.name, |value| value.to_lowercase() == *label)
            }
            Self::WebFeature(feature, data) => test_has_feature(data, &name.name, feature),
            Self::Different(runs) => {
                let mut statuses = runs.iter().map(|results| results.get(fingerprint));
                statuses
                    .next()
                    .is_some_and(|first| statuses.any(|status| status != first))
            }
            Self::Tentative => name.name.contains(".tentative.") || name.name.contains("/tentative/"),
            Self::Optional => name.name.contains(".optional."),
        }
    }

    fn count(args: &[Self], fingerprint: TestFingerprint, name: &TestName) -> usize {
        args.iter().filter(|f| f.matches(fingerprint, name)).count()
    }
}

// =============================================================================
// Plan
// =============================================================================

/// One shard's slice of a plan.
#[derive(Debug)]
pub(crate) struct ShardFilter {
    pub(crate) registry: Arc<RwLock<TestRegistry>>,
    pub(crate) results: HashMap<RunId, Arc<RunResults>>,
    pub(crate) filter: Filter,
}

impl ShardFilter {
    fn scan(
        &self,
        columns: &[RunId],
        opts: AggregationOpts,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>> {
        let runs = columns
            .iter()
            .map(|id| self.results.get(id).cloned().ok_or(Error::UnknownRun(*id)))
            .collect::<Result<Vec<_>>>()?;
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut aggregator = Aggregator::new(&runs, opts);
        for (scanned, (fingerprint, name)) in registry.iter().enumerate() {
            if scanned % CANCEL_CHECK_STRIDE == 0 {
                cancel.check()?;
            }
            if self.filter.matches(fingerprint, name) {
                aggregator.add(fingerprint, name);
            }
        }
        Ok(aggregator.finish())
    }
}

/// A bound, executable query over a fixed set of resident runs.
///
/// The plan holds its own references to the runs' result stores, so evicting
/// a run after binding does not affect an execution already in progress.
#[derive(Debug)]
pub struct Plan {
    run_ids: Vec<RunId>,
    shards: Vec<ShardFilter>,
}

impl Plan {
    pub(crate) fn new(run_ids: Vec<RunId>, shards: Vec<ShardFilter>) -> Self {
        Self { run_ids, shards }
    }

    /// Runs the plan was bound to, in bind order.
    #[must_use]
    pub fn run_ids(&self) -> &[RunId] {
        &self.run_ids
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Executes the plan to completion. Rows carry one summary per entry of
    /// `runs` and are sorted by test name.
    pub fn execute(&self, runs: &[TestRun], opts: AggregationOpts) -> Result<Vec<SearchResult>> {
        self.execute_with(runs, opts, &CancelToken::new())
    }

    /// Like [`execute`](Self::execute), abandoning the scan with
    /// [`Error::Cancelled`] once `cancel` fires.
    pub fn execute_with(
        &self,
        runs: &[TestRun],
        opts: AggregationOpts,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>> {
        let columns: Vec<RunId> = runs.iter().map(|run| run.id).collect();
        let per_shard = self
            .shards
            .par_iter()
            .map(|shard| shard.scan(&columns, opts, cancel))
            .collect::<Result<Vec<_>>>()?;
        let mut rows: Vec<SearchResult> = per_shard.into_iter().flatten().collect();
        rows.sort_by(|a, b| a.test.cmp(&b.test));
        tracing::debug!(
            shards = self.shards.len(),
            runs = columns.len(),
            matches = rows.len(),
            "Executed query plan"
        );
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::registry::compute_fingerprint;

    fn name(test: &str, subtest: Option<&str>) -> TestName {
        TestName {
            name: Arc::from(test),
            subtest: subtest.map(Arc::from),
        }
    }

    fn eval(filter: &Filter, test: &str, subtest: Option<&str>) -> bool {
        filter.matches(compute_fingerprint(test, subtest).unwrap(), &name(test, subtest))
    }

    fn run_results(entries: &[(&str, TestStatus)]) -> Arc<RunResults> {
        Arc::new(
            entries
                .iter()
                .map(|(t, s)| (compute_fingerprint(t, None).unwrap(), *s))
                .collect(),
        )
    }

    fn compile(query: &ConcreteQuery, runs: &[(i64, Arc<RunResults>)]) -> Result<Filter> {
        let map = runs
            .iter()
            .map(|(id, r)| (RunId(*id), Arc::clone(r)))
            .collect();
        let ordered: Vec<_> = runs.iter().map(|(_, r)| Arc::clone(r)).collect();
        Filter::compile(query, &map, &ordered)
    }

    #[test]
    fn name_patterns_ignore_case() {
        let f = compile(
            &ConcreteQuery::TestNamePattern {
                pattern: "DOM".into(),
            },
            &[],
        )
        .unwrap();
        assert!(eval(&f, "/html/dom/a.html", None));
        assert!(!eval(&f, "/css/a.html", None));
    }

    #[test]
    fn path_is_a_prefix() {
        let f = compile(&ConcreteQuery::TestPath { path: "/dom/".into() }, &[]).unwrap();
        assert!(eval(&f, "/dom/nodes/a.html", None));
        assert!(!eval(&f, "/html/dom/a.html", None));
    }

    #[test]
    fn subtest_pattern_needs_a_subtest() {
        let f = compile(
            &ConcreteQuery::SubtestNamePattern {
                subtest: "first".into(),
            },
            &[],
        )
        .unwrap();
        assert!(eval(&f, "/a", Some("The First one")));
        assert!(!eval(&f, "/a/first", None));
    }

    #[test]
    fn status_and_counts() {
        let r1 = run_results(&[("/a", TestStatus::Pass), ("/b", TestStatus::Fail)]);
        let r2 = run_results(&[("/a", TestStatus::Pass), ("/b", TestStatus::Pass)]);
        let runs = [(1, r1), (2, r2)];
        let pass = |run| ConcreteQuery::RunTestStatusEq {
            run: RunId(run),
            status: TestStatus::Pass,
        };

        let two = compile(
            &ConcreteQuery::Count {
                count: 2,
                args: vec![pass(1), pass(2)],
            },
            &runs,
        )
        .unwrap();
        assert!(eval(&two, "/a", None));
        assert!(!eval(&two, "/b", None));

        let more = compile(
            &ConcreteQuery::MoreThan {
                count: 0,
                args: vec![pass(1), pass(2)],
            },
            &runs,
        )
        .unwrap();
        assert!(eval(&more, "/b", None));
        assert!(!eval(&more, "/missing", None));

        let neq = compile(
            &ConcreteQuery::RunTestStatusNeq {
                run: RunId(1),
                status: TestStatus::Pass,
            },
            &runs,
        )
        .unwrap();
        assert!(eval(&neq, "/b", None));
        assert!(eval(&neq, "/missing", None));
    }

    #[test]
    fn unknown_run_fails_compilation() {
        let err = compile(
            &ConcreteQuery::RunTestStatusEq {
                run: RunId(9),
                status: TestStatus::Pass,
            },
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownRun(RunId(9))));
    }

    #[test]
    fn metadata_atoms() {
        let mut links = PathValues::new();
        links.insert("/a/*", "https://CRBUG.com/1");
        let mut labels = PathValues::new();
        labels.insert("/a/b.html", "Interop");
        let results = run_results(&[("/a/b.html", TestStatus::Fail)]);

        let link = compile(
            &ConcreteQuery::Link {
                pattern: "crbug".into(),
                metadata: Arc::new(links.clone()),
            },
            &[],
        )
        .unwrap();
        assert!(eval(&link, "/a/x.html", None));
        assert!(!eval(&link, "/b/x.html", None));

        let label = compile(
            &ConcreteQuery::TestLabel {
                label: "interop".into(),
                metadata: Arc::new(labels),
            },
            &[],
        )
        .unwrap();
        assert!(eval(&label, "/a/b.html", None));

        let triaged = compile(
            &ConcreteQuery::Triaged {
                run: RunId(1),
                metadata: Arc::new(links),
            },
            &[(1, results)],
        )
        .unwrap();
        assert!(eval(&triaged, "/a/b.html", None));
        assert!(!eval(&triaged, "/a/c.html", None));

        let data = WebFeaturesData::from([(
            "/a/b.html".to_string(),
            HashSet::from(["grid".to_string()]),
        )]);
        let feature = compile(
            &ConcreteQuery::TestWebFeature {
                feature: "grid".into(),
                data: Arc::new(data),
            },
            &[],
        )
        .unwrap();
        assert!(eval(&feature, "/a/b.html", None));
        assert!(!eval(&feature, "/a/c.html", None));
    }

    #[test]
    fn qualities() {
        let r1 = run_results(&[("/same", TestStatus::Pass), ("/diff", TestStatus::Pass)]);
        let r2 = run_results(&[("/same", TestStatus::Pass), ("/diff", TestStatus::Fail)]);
        let runs = [(1, r1), (2, r2)];
        let different =
            compile(&ConcreteQuery::MetadataQuality(MetadataQuality::Different), &runs).unwrap();
        assert!(eval(&different, "/diff", None));
        assert!(!eval(&different, "/same", None));

        let tentative =
            compile(&ConcreteQuery::MetadataQuality(MetadataQuality::Tentative), &[]).unwrap();
        assert!(eval(&tentative, "/x/a.tentative.html", None));
        assert!(eval(&tentative, "/x/tentative/a.html", None));
        assert!(!eval(&tentative, "/x/a.html", None));

        let optional =
            compile(&ConcreteQuery::MetadataQuality(MetadataQuality::Optional), &[]).unwrap();
        assert!(eval(&optional, "/x/a.optional.html", None));
        assert!(!eval(&optional, "/x/a.html", None));
    }

    #[test]
    fn cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled(_))));

        let expired = CancelToken::new().with_deadline(Instant::now());
        assert_eq!(expired.check().unwrap_err().code(), "plan.cancelled");
    }
}
