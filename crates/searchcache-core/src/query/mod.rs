//! Query AST.
//!
//! Queries arrive as an [`AbstractQuery`] tree whose status atoms are scoped
//! to *products* ("chrome fails"). The [`Binder`] resolves that tree against
//! a concrete list of runs, producing a [`ConcreteQuery`] whose atoms name
//! explicit [`RunId`]s and whose metadata atoms carry the resolved metadata.
//! Only the concrete form can be compiled into a filter.
//!
//! The concrete constructors [`ConcreteQuery::and`], [`ConcreteQuery::or`]
//! and [`ConcreteQuery::not`] fold constants as they build, so a bound tree
//! never contains a `True`/`False` operand under a combinator.

mod bind;
mod parse;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::metadata::{PathValues, WebFeaturesData};
use crate::run::{ProductSpec, RunId};
use crate::status::TestStatus;

pub use bind::{Binder, prepare_user_query};
pub use parse::{RunQuery, parse_query};

/// Known qualities for `is:` atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataQuality {
    /// Results differ across the queried runs.
    Different,
    /// Test lives in a `tentative` file or directory.
    Tentative,
    /// Test is an `.optional.` test.
    Optional,
}

impl MetadataQuality {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Different => "different",
            Self::Tentative => "tentative",
            Self::Optional => "optional",
        }
    }
}

impl fmt::Display for MetadataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataQuality {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "different" => Ok(Self::Different),
            "tentative" => Ok(Self::Tentative),
            "optional" => Ok(Self::Optional),
            other => Err(QueryError::UnknownQuality(other.to_string())),
        }
    }
}

/// Product-scoped query, not yet runnable.
#[derive(Debug, Clone, PartialEq)]
pub enum AbstractQuery {
    True,
    False,
    TestNamePattern {
        pattern: String,
    },
    SubtestNamePattern {
        subtest: String,
    },
    TestPath {
        path: String,
    },
    /// Some run of `product` (any run when `None`) has `status`.
    TestStatusEq {
        product: Option<ProductSpec>,
        status: TestStatus,
    },
    /// Some run of `product` (any run when `None`) does not have `status`.
    TestStatusNeq {
        product: Option<ProductSpec>,
        status: TestStatus,
    },
    Not(Box<AbstractQuery>),
    Or(Vec<AbstractQuery>),
    And(Vec<AbstractQuery>),
    /// Each argument must be satisfied by at least one single run.
    Exists(Vec<AbstractQuery>),
    /// Each argument must be satisfied by every run.
    All(Vec<AbstractQuery>),
    /// No argument is satisfied by any run.
    None(Vec<AbstractQuery>),
    /// Argument `j` holds in run `i + j` for some offset `i`.
    Sequential(Vec<AbstractQuery>),
    /// Exactly `count` runs satisfy `predicate`.
    Count {
        count: usize,
        predicate: Box<AbstractQuery>,
    },
    MoreThan {
        count: usize,
        predicate: Box<AbstractQuery>,
    },
    LessThan {
        count: usize,
        predicate: Box<AbstractQuery>,
    },
    /// A triage link URL for the test contains `pattern`.
    Link {
        pattern: String,
    },
    /// The test has triage metadata for a run of `product`, or test-level
    /// metadata when `None`.
    Triaged {
        product: Option<ProductSpec>,
    },
    TestLabel {
        label: String,
    },
    TestWebFeature {
        feature: String,
    },
    MetadataQuality(MetadataQuality),
}

impl AbstractQuery {
    #[must_use]
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::TestNamePattern {
            pattern: pattern.into(),
        }
    }

    #[must_use]
    pub fn status_eq(product: Option<ProductSpec>, status: TestStatus) -> Self {
        Self::TestStatusEq { product, status }
    }

    #[must_use]
    pub fn status_neq(product: Option<ProductSpec>, status: TestStatus) -> Self {
        Self::TestStatusNeq { product, status }
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// Run-scoped query, directly evaluable against index data.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcreteQuery {
    True,
    False,
    TestNamePattern {
        pattern: String,
    },
    SubtestNamePattern {
        subtest: String,
    },
    TestPath {
        path: String,
    },
    RunTestStatusEq {
        run: RunId,
        status: TestStatus,
    },
    RunTestStatusNeq {
        run: RunId,
        status: TestStatus,
    },
    And(Vec<ConcreteQuery>),
    Or(Vec<ConcreteQuery>),
    Not(Box<ConcreteQuery>),
    /// Exactly `count` of `args` hold.
    Count {
        count: usize,
        args: Vec<ConcreteQuery>,
    },
    MoreThan {
        count: usize,
        args: Vec<ConcreteQuery>,
    },
    LessThan {
        count: usize,
        args: Vec<ConcreteQuery>,
    },
    Link {
        pattern: String,
        metadata: Arc<PathValues>,
    },
    Triaged {
        run: RunId,
        metadata: Arc<PathValues>,
    },
    TestLabel {
        label: String,
        metadata: Arc<PathValues>,
    },
    TestWebFeature {
        feature: String,
        data: Arc<WebFeaturesData>,
    },
    MetadataQuality(MetadataQuality),
}

impl ConcreteQuery {
    /// Conjunction with constant folding: `True` operands are dropped, any
    /// `False` operand makes the whole conjunction `False`, and nested `And`s
    /// are flattened. An empty conjunction is `True`.
    #[must_use]
    pub fn and(args: impl IntoIterator<Item = Self>) -> Self {
        let mut out = Vec::new();
        for arg in args {
            match arg {
                Self::True => {}
                Self::False => return Self::False,
                Self::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Self::True,
            1 => out.swap_remove(0),
            _ => Self::And(out),
        }
    }

    /// Disjunction with constant folding: `False` operands are dropped, any
    /// `True` operand makes the whole disjunction `True`, and nested `Or`s are
    /// flattened. An empty disjunction is `False`.
    #[must_use]
    pub fn or(args: impl IntoIterator<Item = Self>) -> Self {
        let mut out = Vec::new();
        for arg in args {
            match arg {
                Self::False => {}
                Self::True => return Self::True,
                Self::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Self::False,
            1 => out.swap_remove(0),
            _ => Self::Or(out),
        }
    }

    /// Negation, folding constants and double negation.
    #[must_use]
    pub fn not(arg: Self) -> Self {
        match arg {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// Number of atoms in the tree. Constants count zero, a negation counts
    /// itself plus its operand.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::True | Self::False => 0,
            Self::And(args)
            | Self::Or(args)
            | Self::Count { args, .. }
            | Self::MoreThan { args, .. }
            | Self::LessThan { args, .. } => args.iter().map(Self::size).sum(),
            Self::Not(arg) => 1 + arg.size(),
            _ => 1,
        }
    }

    /// Every run id referenced by a run-scoped atom.
    #[must_use]
    pub fn run_ids(&self) -> BTreeSet<RunId> {
        let mut ids = BTreeSet::new();
        self.collect_run_ids(&mut ids);
        ids
    }

    fn collect_run_ids(&self, ids: &mut BTreeSet<RunId>) {
        match self {
            Self::RunTestStatusEq { run, .. }
            | Self::RunTestStatusNeq { run, .. }
            | Self::Triaged { run, .. } => {
                ids.insert(*run);
            }
            Self::And(args)
            | Self::Or(args)
            | Self::Count { args, .. }
            | Self::MoreThan { args, .. }
            | Self::LessThan { args, .. } => {
                for arg in args {
                    arg.collect_run_ids(ids);
                }
            }
            Self::Not(arg) => arg.collect_run_ids(ids),
            _ => {}
        }
    }
}
