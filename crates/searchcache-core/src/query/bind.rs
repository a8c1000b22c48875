//! Binding abstract queries to concrete runs.

use std::sync::Arc;

use crate::metadata::{
    LinkScope, MetadataCache, MetadataFetcher, MetadataTable, WebFeaturesCache,
    WebFeaturesData, WebFeaturesFetcher, label_values, link_values,
};
use crate::run::{ProductSpec, RunId, TestRun};
use crate::status::TestStatus;

use super::{AbstractQuery, ConcreteQuery};

/// Resolves [`AbstractQuery`] trees against a run list.
///
/// Metadata-scoped atoms read the tables through the injected fetchers at
/// bind time. A fetch failure is logged and treated as an empty table, so a
/// metadata outage degrades those atoms to "no match" instead of failing the
/// whole query.
#[derive(Clone)]
pub struct Binder {
    metadata: Arc<dyn MetadataFetcher>,
    web_features: Arc<dyn WebFeaturesFetcher>,
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binder").finish_non_exhaustive()
    }
}

impl Default for Binder {
    fn default() -> Self {
        Self::new(
            Arc::new(MetadataCache::new()),
            Arc::new(WebFeaturesCache::new()),
        )
    }
}

impl Binder {
    #[must_use]
    pub fn new(
        metadata: Arc<dyn MetadataFetcher>,
        web_features: Arc<dyn WebFeaturesFetcher>,
    ) -> Self {
        Self {
            metadata,
            web_features,
        }
    }

    /// Binds `query` to `runs`, simplifying constants away as it goes.
    #[must_use]
    pub fn bind(&self, query: &AbstractQuery, runs: &[TestRun]) -> ConcreteQuery {
        match query {
            AbstractQuery::True => ConcreteQuery::True,
            AbstractQuery::False => ConcreteQuery::False,
            AbstractQuery::TestNamePattern { pattern } => ConcreteQuery::TestNamePattern {
                pattern: pattern.clone(),
            },
            AbstractQuery::SubtestNamePattern { subtest } => ConcreteQuery::SubtestNamePattern {
                subtest: subtest.clone(),
            },
            AbstractQuery::TestPath { path } => ConcreteQuery::TestPath { path: path.clone() },
            AbstractQuery::TestStatusEq { product, status } => {
                bind_status(product.as_ref(), runs, |run| ConcreteQuery::RunTestStatusEq {
                    run,
                    status: *status,
                })
            }
            AbstractQuery::TestStatusNeq { product, status } => {
                bind_status(product.as_ref(), runs, |run| ConcreteQuery::RunTestStatusNeq {
                    run,
                    status: *status,
                })
            }
            AbstractQuery::Not(arg) => ConcreteQuery::not(self.bind(arg, runs)),
            AbstractQuery::Or(args) => ConcreteQuery::or(args.iter().map(|a| self.bind(a, runs))),
            AbstractQuery::And(args) => {
                ConcreteQuery::and(args.iter().map(|a| self.bind(a, runs)))
            }
            AbstractQuery::Exists(args) => self.bind_exists(args, runs),
            AbstractQuery::All(args) => ConcreteQuery::and(args.iter().map(|arg| {
                ConcreteQuery::and(runs.iter().map(|run| self.bind(arg, std::slice::from_ref(run))))
            })),
            AbstractQuery::None(args) => ConcreteQuery::not(self.bind_exists(args, runs)),
            AbstractQuery::Sequential(args) => self.bind_sequential(args, runs),
            AbstractQuery::Count { count, predicate } => ConcreteQuery::Count {
                count: *count,
                args: self.bind_per_run(predicate, runs),
            },
            AbstractQuery::MoreThan { count, predicate } => ConcreteQuery::MoreThan {
                count: *count,
                args: self.bind_per_run(predicate, runs),
            },
            AbstractQuery::LessThan { count, predicate } => ConcreteQuery::LessThan {
                count: *count,
                args: self.bind_per_run(predicate, runs),
            },
            AbstractQuery::Link { pattern } => ConcreteQuery::Link {
                pattern: pattern.clone(),
                metadata: Arc::new(link_values(
                    &self.metadata_table(),
                    LinkScope::TestLevelAndRuns(runs),
                )),
            },
            AbstractQuery::Triaged { product } => self.bind_triaged(product.as_ref(), runs),
            AbstractQuery::TestLabel { label } => ConcreteQuery::TestLabel {
                label: label.clone(),
                metadata: Arc::new(label_values(&self.metadata_table())),
            },
            AbstractQuery::TestWebFeature { feature } => ConcreteQuery::TestWebFeature {
                feature: feature.clone(),
                data: self.web_features_data(),
            },
            AbstractQuery::MetadataQuality(quality) => ConcreteQuery::MetadataQuality(*quality),
        }
    }

    /// One bound copy of `arg` per run, each seeing only that run.
    fn bind_per_run(&self, arg: &AbstractQuery, runs: &[TestRun]) -> Vec<ConcreteQuery> {
        runs.iter()
            .map(|run| self.bind(arg, std::slice::from_ref(run)))
            .collect()
    }

    fn bind_exists(&self, args: &[AbstractQuery], runs: &[TestRun]) -> ConcreteQuery {
        // A single argument binds across all runs at once.
        if let [only] = args {
            return self.bind(only, runs);
        }
        ConcreteQuery::and(
            args.iter()
                .map(|arg| ConcreteQuery::or(self.bind_per_run(arg, runs))),
        )
    }

    fn bind_sequential(&self, args: &[AbstractQuery], runs: &[TestRun]) -> ConcreteQuery {
        if args.is_empty() || args.len() > runs.len() {
            return ConcreteQuery::False;
        }
        let windows = runs.windows(args.len()).map(|window| {
            ConcreteQuery::and(
                args.iter()
                    .zip(window)
                    .map(|(arg, run)| self.bind(arg, std::slice::from_ref(run))),
            )
        });
        ConcreteQuery::or(windows)
    }

    fn bind_triaged(&self, product: Option<&ProductSpec>, runs: &[TestRun]) -> ConcreteQuery {
        let table = self.metadata_table();
        let bound = runs
            .iter()
            .filter(|run| product.is_none_or(|p| p.matches(run)))
            .filter_map(|run| {
                // No product means test-level triage only.
                let scope = match product {
                    Some(_) => LinkScope::Runs(std::slice::from_ref(run)),
                    None => LinkScope::TestLevel,
                };
                let metadata = link_values(&table, scope);
                (!metadata.is_empty()).then(|| ConcreteQuery::Triaged {
                    run: run.id,
                    metadata: Arc::new(metadata),
                })
            });
        ConcreteQuery::or(bound)
    }

    fn metadata_table(&self) -> Arc<MetadataTable> {
        self.metadata.fetch().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Metadata fetch failed; binding against empty table");
            Arc::new(MetadataTable::new())
        })
    }

    fn web_features_data(&self) -> Arc<WebFeaturesData> {
        self.web_features.fetch().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Web features fetch failed; binding against empty data");
            Arc::new(WebFeaturesData::new())
        })
    }
}

fn bind_status(
    product: Option<&ProductSpec>,
    runs: &[TestRun],
    atom: impl Fn(RunId) -> ConcreteQuery,
) -> ConcreteQuery {
    let mut matched: Vec<ConcreteQuery> = runs
        .iter()
        .filter(|run| product.is_none_or(|p| p.matches(run)))
        .map(|run| atom(run.id))
        .collect();
    match matched.len() {
        0 => ConcreteQuery::False,
        1 => matched.swap_remove(0),
        _ => ConcreteQuery::Or(matched),
    }
}

/// Restricts a bound user query to tests that have a result in at least one
/// of `run_ids`. Merges into an existing top-level conjunction.
#[must_use]
pub fn prepare_user_query(run_ids: &[RunId], query: ConcreteQuery) -> ConcreteQuery {
    let present = ConcreteQuery::or(run_ids.iter().map(|&run| {
        ConcreteQuery::not(ConcreteQuery::RunTestStatusEq {
            run,
            status: TestStatus::Unknown,
        })
    }));
    match query {
        ConcreteQuery::And(mut args) => {
            args.insert(0, present);
            ConcreteQuery::and(args)
        }
        other => ConcreteQuery::and([present, other]),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::metadata::MetadataLink;
    use crate::query::MetadataQuality;

    fn runs() -> Vec<TestRun> {
        vec![
            TestRun::new(1, "chrome"),
            TestRun::new(2, "safari"),
            TestRun::new(3, "chrome").with_labels(["experimental"]),
        ]
    }

    fn product(s: &str) -> Option<ProductSpec> {
        Some(s.parse().unwrap())
    }

    fn eq(run: i64, status: TestStatus) -> ConcreteQuery {
        ConcreteQuery::RunTestStatusEq {
            run: RunId(run),
            status,
        }
    }

    #[test]
    fn status_eq_without_matching_runs_is_false() {
        let q = AbstractQuery::status_eq(product("firefox"), TestStatus::Pass);
        assert_eq!(Binder::default().bind(&q, &runs()), ConcreteQuery::False);
    }

    #[test]
    fn status_neq_single_match_is_not_a_disjunction() {
        let q = AbstractQuery::status_neq(product("safari"), TestStatus::Pass);
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::RunTestStatusNeq {
                run: RunId(2),
                status: TestStatus::Pass
            }
        );
    }

    #[test]
    fn status_eq_two_matches_is_or() {
        let q = AbstractQuery::status_eq(product("chrome"), TestStatus::Fail);
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::Or(vec![eq(1, TestStatus::Fail), eq(3, TestStatus::Fail)])
        );
    }

    #[test]
    fn status_without_product_binds_every_run() {
        let q = AbstractQuery::status_eq(None, TestStatus::Ok);
        let bound = Binder::default().bind(&q, &runs());
        assert_eq!(bound.run_ids().len(), 3);
    }

    #[test]
    fn and_or_simplify_constant_branches() {
        let binder = Binder::default();
        let firefox = AbstractQuery::status_eq(product("firefox"), TestStatus::Pass);
        let safari = AbstractQuery::status_eq(product("safari"), TestStatus::Pass);

        let and = AbstractQuery::And(vec![AbstractQuery::True, safari.clone()]);
        assert_eq!(binder.bind(&and, &runs()), eq(2, TestStatus::Pass));

        let and_false = AbstractQuery::And(vec![safari.clone(), firefox.clone()]);
        assert_eq!(binder.bind(&and_false, &runs()), ConcreteQuery::False);

        let or = AbstractQuery::Or(vec![firefox.clone(), safari]);
        assert_eq!(binder.bind(&or, &runs()), eq(2, TestStatus::Pass));

        let or_true = AbstractQuery::Or(vec![firefox, AbstractQuery::True]);
        assert_eq!(binder.bind(&or_true, &runs()), ConcreteQuery::True);
    }

    #[test]
    fn exists_single_argument_binds_directly() {
        let inner = AbstractQuery::And(vec![
            AbstractQuery::status_eq(product("chrome"), TestStatus::Pass),
            AbstractQuery::status_eq(product("safari"), TestStatus::Fail),
        ]);
        let binder = Binder::default();
        assert_eq!(
            binder.bind(&AbstractQuery::Exists(vec![inner.clone()]), &runs()),
            binder.bind(&inner, &runs())
        );
    }

    #[test]
    fn exists_splits_arguments_per_run() {
        let q = AbstractQuery::Exists(vec![
            AbstractQuery::status_eq(product("chrome"), TestStatus::Pass),
            AbstractQuery::status_eq(product("safari"), TestStatus::Fail),
        ]);
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::And(vec![
                ConcreteQuery::Or(vec![eq(1, TestStatus::Pass), eq(3, TestStatus::Pass)]),
                eq(2, TestStatus::Fail),
            ])
        );
    }

    #[test]
    fn all_requires_every_run() {
        let q = AbstractQuery::All(vec![AbstractQuery::status_eq(None, TestStatus::Pass)]);
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::And(vec![
                eq(1, TestStatus::Pass),
                eq(2, TestStatus::Pass),
                eq(3, TestStatus::Pass),
            ])
        );
    }

    #[test]
    fn none_negates_exists() {
        let arg = AbstractQuery::status_eq(product("safari"), TestStatus::Crash);
        let q = AbstractQuery::None(vec![arg]);
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::Not(Box::new(eq(2, TestStatus::Crash)))
        );
    }

    #[test]
    fn sequential_binds_each_alignment() {
        let q = AbstractQuery::Sequential(vec![
            AbstractQuery::status_eq(None, TestStatus::Pass),
            AbstractQuery::status_eq(None, TestStatus::Fail),
        ]);
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::Or(vec![
                ConcreteQuery::And(vec![eq(1, TestStatus::Pass), eq(2, TestStatus::Fail)]),
                ConcreteQuery::And(vec![eq(2, TestStatus::Pass), eq(3, TestStatus::Fail)]),
            ])
        );
    }

    #[test]
    fn sequential_longer_than_runs_is_false() {
        let q = AbstractQuery::Sequential(vec![AbstractQuery::True; 4]);
        assert_eq!(Binder::default().bind(&q, &runs()), ConcreteQuery::False);
    }

    #[test]
    fn count_binds_predicate_per_run() {
        let q = AbstractQuery::Count {
            count: 2,
            predicate: Box::new(AbstractQuery::status_eq(product("chrome"), TestStatus::Pass)),
        };
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::Count {
                count: 2,
                args: vec![
                    eq(1, TestStatus::Pass),
                    ConcreteQuery::False,
                    eq(3, TestStatus::Pass)
                ],
            }
        );
    }

    fn metadata_binder() -> Binder {
        let cache = MetadataCache::new();
        let mut table = MetadataTable::new();
        table.insert(
            "/a/*".into(),
            vec![
                MetadataLink::url(product("chrome"), "https://crbug.com/1"),
                MetadataLink::url(None, "https://github.com/issue/2"),
                MetadataLink::label("interop"),
            ],
        );
        cache.set(table);
        let features = WebFeaturesCache::new();
        features.set(WebFeaturesData::from([(
            "/a/b.html".to_string(),
            HashSet::from(["grid".to_string()]),
        )]));
        Binder::new(Arc::new(cache), Arc::new(features))
    }

    #[test]
    fn triaged_binds_per_matching_run() {
        let binder = metadata_binder();
        let q = AbstractQuery::Triaged {
            product: product("chrome"),
        };
        let ConcreteQuery::Or(args) = binder.bind(&q, &runs()) else {
            panic!("expected a disjunction over both chrome runs");
        };
        assert_eq!(args.len(), 2);
        assert!(matches!(&args[0], ConcreteQuery::Triaged { run: RunId(1), .. }));

        let safari = AbstractQuery::Triaged {
            product: product("safari"),
        };
        assert_eq!(binder.bind(&safari, &runs()), ConcreteQuery::False);
    }

    #[test]
    fn triaged_without_product_uses_test_level_metadata() {
        let binder = metadata_binder();
        let bound = binder.bind(&AbstractQuery::Triaged { product: None }, &runs()[1..2]);
        let ConcreteQuery::Triaged { run, metadata } = bound else {
            panic!("expected a single triaged atom");
        };
        assert_eq!(run, RunId(2));
        assert_eq!(
            metadata.values_for("/a/x.html"),
            vec!["https://github.com/issue/2"]
        );
    }

    #[test]
    fn link_label_and_feature_carry_resolved_data() {
        let binder = metadata_binder();
        let ConcreteQuery::Link { metadata, .. } = binder.bind(
            &AbstractQuery::Link {
                pattern: "crbug".into(),
            },
            &runs(),
        ) else {
            panic!("expected link");
        };
        assert_eq!(metadata.values_for("/a/b.html").len(), 2);

        let ConcreteQuery::TestLabel { metadata, .. } = binder.bind(
            &AbstractQuery::TestLabel {
                label: "interop".into(),
            },
            &runs(),
        ) else {
            panic!("expected label");
        };
        assert_eq!(metadata.values_for("/a/b.html"), vec!["interop"]);

        let ConcreteQuery::TestWebFeature { data, .. } = binder.bind(
            &AbstractQuery::TestWebFeature {
                feature: "grid".into(),
            },
            &runs(),
        ) else {
            panic!("expected feature");
        };
        assert!(data.contains_key("/a/b.html"));
    }

    #[test]
    fn quality_passes_through() {
        let q = AbstractQuery::MetadataQuality(MetadataQuality::Different);
        assert_eq!(
            Binder::default().bind(&q, &runs()),
            ConcreteQuery::MetadataQuality(MetadataQuality::Different)
        );
    }

    #[test]
    fn prepare_user_query_merges_into_and() {
        let ids = [RunId(1), RunId(2)];
        let present = ConcreteQuery::Or(vec![
            ConcreteQuery::not(eq(1, TestStatus::Unknown)),
            ConcreteQuery::not(eq(2, TestStatus::Unknown)),
        ]);
        let pattern = ConcreteQuery::TestNamePattern {
            pattern: "a".into(),
        };

        assert_eq!(
            prepare_user_query(&ids, pattern.clone()),
            ConcreteQuery::And(vec![present.clone(), pattern.clone()])
        );
        assert_eq!(
            prepare_user_query(
                &ids,
                ConcreteQuery::And(vec![pattern.clone(), eq(1, TestStatus::Pass)])
            ),
            ConcreteQuery::And(vec![present, pattern, eq(1, TestStatus::Pass)])
        );
        assert_eq!(
            prepare_user_query(&ids[..1], ConcreteQuery::True),
            ConcreteQuery::not(eq(1, TestStatus::Unknown))
        );
    }
}
