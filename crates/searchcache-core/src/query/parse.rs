//! JSON query fragments.
//!
//! A fragment carries no explicit discriminant. Each known shape is tried in
//! a fixed order and the first one that accepts the fragment wins, so
//! `{"pattern": "a", "status": "PASS"}` is a name pattern, not a status atom.
//! Every table entry names the property its shape requires; the property
//! check is a fast reject that never changes which entry wins.

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::QueryError;
use crate::run::{ProductSpec, RunId};
use crate::status::TestStatus;

use super::AbstractQuery;

type Object = Map<String, Value>;
type FragmentParser = fn(&Object) -> Result<AbstractQuery, QueryError>;

/// Shapes in precedence order.
const FRAGMENTS: &[(&str, FragmentParser)] = &[
    ("pattern", parse_pattern),
    ("subtest", parse_subtest),
    ("path", parse_path),
    ("status", parse_status_eq),
    ("status", parse_status_neq),
    ("not", parse_not),
    ("or", parse_or),
    ("and", parse_and),
    ("exists", parse_exists),
    ("all", parse_all),
    ("none", parse_none),
    ("sequential", parse_sequential),
    ("count", parse_count),
    ("lessThan", parse_less_than),
    ("moreThan", parse_more_than),
    ("link", parse_link),
    ("is", parse_quality),
    ("triaged", parse_triaged),
    ("label", parse_label),
    ("feature", parse_feature),
];

/// Parses one query fragment.
///
/// Any fragment no shape accepts, including one whose nested fragment is
/// unparseable, yields [`QueryError::UnknownFragment`].
pub fn parse_query(fragment: &Value) -> Result<AbstractQuery, QueryError> {
    let Value::Object(object) = fragment else {
        return Err(QueryError::UnknownFragment);
    };
    for (key, parser) in FRAGMENTS {
        if !object.contains_key(*key) {
            continue;
        }
        match parser(object) {
            Ok(query) => return Ok(query),
            Err(err) => tracing::trace!(key, error = %err, "Query fragment shape rejected"),
        }
    }
    Err(QueryError::UnknownFragment)
}

fn string_field(object: &Object, key: &str) -> Result<String, QueryError> {
    match object.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(QueryError::UnknownFragment),
    }
}

fn parse_pattern(object: &Object) -> Result<AbstractQuery, QueryError> {
    string_field(object, "pattern").map(|pattern| AbstractQuery::TestNamePattern { pattern })
}

fn parse_subtest(object: &Object) -> Result<AbstractQuery, QueryError> {
    string_field(object, "subtest").map(|subtest| AbstractQuery::SubtestNamePattern { subtest })
}

fn parse_path(object: &Object) -> Result<AbstractQuery, QueryError> {
    string_field(object, "path").map(|path| AbstractQuery::TestPath { path })
}

/// `product` (or the legacy `browser_name`) selecting the runs of a status
/// atom. Absent or empty means every run.
fn parse_product(object: &Object) -> Result<Option<ProductSpec>, QueryError> {
    let field = |key: &str| match object.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(QueryError::UnknownFragment),
    };
    let mut product = field("product")?;
    if product.is_empty() {
        product = field("browser_name")?;
    }
    if product.is_empty() {
        return Ok(None);
    }
    ProductSpec::from_str(&product).map(Some)
}

fn parse_status(raw: &str) -> Result<TestStatus, QueryError> {
    if raw.is_empty() {
        return Err(QueryError::InvalidStatus(String::new()));
    }
    raw.parse()
}

fn parse_status_eq(object: &Object) -> Result<AbstractQuery, QueryError> {
    let status = parse_status(&string_field(object, "status")?)?;
    Ok(AbstractQuery::TestStatusEq {
        product: parse_product(object)?,
        status,
    })
}

fn parse_status_neq(object: &Object) -> Result<AbstractQuery, QueryError> {
    let Some(Value::Object(status)) = object.get("status") else {
        return Err(QueryError::UnknownFragment);
    };
    let status = parse_status(&string_field(status, "not")?)?;
    Ok(AbstractQuery::TestStatusNeq {
        product: parse_product(object)?,
        status,
    })
}

fn parse_not(object: &Object) -> Result<AbstractQuery, QueryError> {
    let inner = object.get("not").ok_or(QueryError::UnknownFragment)?;
    parse_query(inner).map(AbstractQuery::negate)
}

/// Non-empty array of nested fragments under `key`.
fn parse_list(object: &Object, key: &str) -> Result<Vec<AbstractQuery>, QueryError> {
    match object.get(key) {
        Some(Value::Array(items)) if !items.is_empty() => items.iter().map(parse_query).collect(),
        _ => Err(QueryError::UnknownFragment),
    }
}

fn parse_or(object: &Object) -> Result<AbstractQuery, QueryError> {
    parse_list(object, "or").map(AbstractQuery::Or)
}

fn parse_and(object: &Object) -> Result<AbstractQuery, QueryError> {
    parse_list(object, "and").map(AbstractQuery::And)
}

fn parse_exists(object: &Object) -> Result<AbstractQuery, QueryError> {
    parse_list(object, "exists").map(AbstractQuery::Exists)
}

fn parse_all(object: &Object) -> Result<AbstractQuery, QueryError> {
    parse_list(object, "all").map(AbstractQuery::All)
}

fn parse_none(object: &Object) -> Result<AbstractQuery, QueryError> {
    parse_list(object, "none").map(AbstractQuery::None)
}

fn parse_sequential(object: &Object) -> Result<AbstractQuery, QueryError> {
    parse_list(object, "sequential").map(AbstractQuery::Sequential)
}

fn parse_threshold(
    object: &Object,
    key: &str,
) -> Result<(usize, Box<AbstractQuery>), QueryError> {
    let count = object
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(QueryError::UnknownFragment)?;
    let predicate = object.get("where").ok_or(QueryError::UnknownFragment)?;
    Ok((count, Box::new(parse_query(predicate)?)))
}

fn parse_count(object: &Object) -> Result<AbstractQuery, QueryError> {
    let (count, predicate) = parse_threshold(object, "count")?;
    Ok(AbstractQuery::Count { count, predicate })
}

fn parse_less_than(object: &Object) -> Result<AbstractQuery, QueryError> {
    let (count, predicate) = parse_threshold(object, "lessThan")?;
    Ok(AbstractQuery::LessThan { count, predicate })
}

fn parse_more_than(object: &Object) -> Result<AbstractQuery, QueryError> {
    let (count, predicate) = parse_threshold(object, "moreThan")?;
    Ok(AbstractQuery::MoreThan { count, predicate })
}

fn parse_link(object: &Object) -> Result<AbstractQuery, QueryError> {
    string_field(object, "link").map(|pattern| AbstractQuery::Link { pattern })
}

fn parse_quality(object: &Object) -> Result<AbstractQuery, QueryError> {
    string_field(object, "is")?
        .parse()
        .map(AbstractQuery::MetadataQuality)
}

fn parse_triaged(object: &Object) -> Result<AbstractQuery, QueryError> {
    let product = string_field(object, "triaged")?;
    let product = if product.is_empty() {
        None
    } else {
        Some(product.parse()?)
    };
    Ok(AbstractQuery::Triaged { product })
}

fn parse_label(object: &Object) -> Result<AbstractQuery, QueryError> {
    string_field(object, "label").map(|label| AbstractQuery::TestLabel { label })
}

fn parse_feature(object: &Object) -> Result<AbstractQuery, QueryError> {
    string_field(object, "feature").map(|feature| AbstractQuery::TestWebFeature { feature })
}

impl<'de> Deserialize<'de> for AbstractQuery {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_query(&value).map_err(serde::de::Error::custom)
    }
}

/// A query request: the runs to search plus the query over them.
#[derive(Debug, Clone, PartialEq)]
pub struct RunQuery {
    pub run_ids: Vec<RunId>,
    pub query: AbstractQuery,
}

#[derive(Deserialize)]
struct RawRunQuery {
    #[serde(default)]
    run_ids: Vec<RunId>,
    #[serde(default)]
    query: Option<Value>,
}

impl TryFrom<RawRunQuery> for RunQuery {
    type Error = QueryError;

    fn try_from(raw: RawRunQuery) -> Result<Self, Self::Error> {
        if raw.run_ids.is_empty() {
            return Err(QueryError::MissingRunIds);
        }
        let query = match raw.query {
            Some(fragment) => parse_query(&fragment)?,
            None => AbstractQuery::True,
        };
        Ok(Self {
            run_ids: raw.run_ids,
            query,
        })
    }
}

impl<'de> Deserialize<'de> for RunQuery {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawRunQuery::deserialize(deserializer)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl RunQuery {
    /// Parses a request body.
    pub fn from_json(body: &str) -> crate::Result<Self> {
        let raw: RawRunQuery = serde_json::from_str(body)?;
        Ok(Self::try_from(raw)?)
    }

    /// Rejects requests naming more than `max` runs.
    pub fn check_run_limit(&self, max: usize) -> Result<(), QueryError> {
        if self.run_ids.len() > max {
            return Err(QueryError::TooManyRuns {
                requested: self.run_ids.len(),
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::query::MetadataQuality;

    fn parse(value: Value) -> AbstractQuery {
        parse_query(&value).unwrap()
    }

    fn chrome() -> Option<ProductSpec> {
        Some("chrome".parse().unwrap())
    }

    #[test]
    fn leaf_atoms() {
        assert_eq!(parse(json!({"pattern": "/dom/"})), AbstractQuery::pattern("/dom/"));
        assert_eq!(
            parse(json!({"subtest": "first"})),
            AbstractQuery::SubtestNamePattern {
                subtest: "first".into()
            }
        );
        assert_eq!(
            parse(json!({"path": "/css/"})),
            AbstractQuery::TestPath {
                path: "/css/".into()
            }
        );
        assert_eq!(
            parse(json!({"link": "crbug"})),
            AbstractQuery::Link {
                pattern: "crbug".into()
            }
        );
        assert_eq!(
            parse(json!({"label": "interop"})),
            AbstractQuery::TestLabel {
                label: "interop".into()
            }
        );
        assert_eq!(
            parse(json!({"feature": "gridLanes"})),
            AbstractQuery::TestWebFeature {
                feature: "gridLanes".into()
            }
        );
        assert_eq!(
            parse(json!({"is": "tentative"})),
            AbstractQuery::MetadataQuality(MetadataQuality::Tentative)
        );
    }

    #[test]
    fn status_atoms() {
        assert_eq!(
            parse(json!({"product": "chrome", "status": "pass"})),
            AbstractQuery::status_eq(chrome(), TestStatus::Pass)
        );
        assert_eq!(
            parse(json!({"browser_name": "chrome", "status": "FAIL"})),
            AbstractQuery::status_eq(chrome(), TestStatus::Fail)
        );
        assert_eq!(
            parse(json!({"status": {"not": "ok"}})),
            AbstractQuery::status_neq(None, TestStatus::Ok)
        );
        assert_eq!(
            parse_query(&json!({"status": "GREEN"})),
            Err(QueryError::UnknownFragment)
        );
        assert_eq!(
            parse_query(&json!({"product": "chrome@zz", "status": "PASS"})),
            Err(QueryError::UnknownFragment)
        );
    }

    #[test]
    fn earlier_shapes_win() {
        assert_eq!(
            parse(json!({"pattern": "a", "status": "PASS"})),
            AbstractQuery::pattern("a")
        );
        assert_eq!(
            parse(json!({"is": "different", "triaged": "chrome"})),
            AbstractQuery::MetadataQuality(MetadataQuality::Different)
        );
        // A rejected shape falls through to later ones.
        assert_eq!(
            parse(json!({"is": "shiny", "label": "x"})),
            AbstractQuery::TestLabel { label: "x".into() }
        );
    }

    #[test]
    fn combinators_nest() {
        let q = parse(json!({
            "and": [
                {"pattern": "/dom/"},
                {"or": [{"status": "FAIL"}, {"not": {"status": "PASS"}}]},
                {"exists": [{"product": "chrome", "status": "PASS"}]}
            ]
        }));
        assert_eq!(
            q,
            AbstractQuery::And(vec![
                AbstractQuery::pattern("/dom/"),
                AbstractQuery::Or(vec![
                    AbstractQuery::status_eq(None, TestStatus::Fail),
                    AbstractQuery::status_eq(None, TestStatus::Pass).negate(),
                ]),
                AbstractQuery::Exists(vec![AbstractQuery::status_eq(chrome(), TestStatus::Pass)]),
            ])
        );
    }

    #[test]
    fn thresholds() {
        assert_eq!(
            parse(json!({"count": 2, "where": {"status": "PASS"}})),
            AbstractQuery::Count {
                count: 2,
                predicate: Box::new(AbstractQuery::status_eq(None, TestStatus::Pass)),
            }
        );
        assert!(matches!(
            parse(json!({"moreThan": 1, "where": {"pattern": "x"}})),
            AbstractQuery::MoreThan { count: 1, .. }
        ));
        assert!(matches!(
            parse(json!({"lessThan": 3, "where": {"pattern": "x"}})),
            AbstractQuery::LessThan { count: 3, .. }
        ));
        assert_eq!(
            parse_query(&json!({"count": -1, "where": {"pattern": "x"}})),
            Err(QueryError::UnknownFragment)
        );
        assert_eq!(
            parse_query(&json!({"count": 1})),
            Err(QueryError::UnknownFragment)
        );
    }

    #[test]
    fn triaged_product_is_optional() {
        assert_eq!(
            parse(json!({"triaged": ""})),
            AbstractQuery::Triaged { product: None }
        );
        assert_eq!(
            parse(json!({"triaged": "chrome"})),
            AbstractQuery::Triaged { product: chrome() }
        );
    }

    #[test]
    fn rejects_unknown_shapes() {
        for bad in [
            json!({}),
            json!([]),
            json!("pattern"),
            json!({"or": []}),
            json!({"and": [{"bogus": 1}]}),
            json!({"not": {"bogus": 1}}),
            json!({"pattern": 7}),
        ] {
            assert_eq!(parse_query(&bad), Err(QueryError::UnknownFragment), "{bad}");
        }
    }

    #[test]
    fn run_query_requires_run_ids() {
        let rq = RunQuery::from_json(r#"{"run_ids": [1, 2], "query": {"pattern": "x"}}"#).unwrap();
        assert_eq!(rq.run_ids, vec![RunId(1), RunId(2)]);
        assert_eq!(rq.query, AbstractQuery::pattern("x"));

        let all = RunQuery::from_json(r#"{"run_ids": [5]}"#).unwrap();
        assert_eq!(all.query, AbstractQuery::True);

        let err = RunQuery::from_json(r#"{"run_ids": [], "query": {"pattern": "x"}}"#).unwrap_err();
        assert_eq!(err.code(), "query.missing_run_ids");

        let err = RunQuery::from_json(r#"{"run_ids": [1], "query": {"nope": 1}}"#).unwrap_err();
        assert_eq!(err.code(), "query.unknown_fragment");
    }

    #[test]
    fn run_limit_counts_requested_ids() {
        let rq = RunQuery::from_json(r#"{"run_ids": [1, 2, 3]}"#).unwrap();
        assert!(rq.check_run_limit(3).is_ok());
        assert_eq!(
            rq.check_run_limit(2),
            Err(QueryError::TooManyRuns {
                requested: 3,
                max: 2
            })
        );
    }

    #[test]
    fn deserializes_through_serde() {
        let q: AbstractQuery = serde_json::from_str(r#"{"none": [{"status": "CRASH"}]}"#).unwrap();
        assert_eq!(
            q,
            AbstractQuery::None(vec![AbstractQuery::status_eq(None, TestStatus::Crash)])
        );
        assert!(serde_json::from_str::<AbstractQuery>(r#"{"x": 1}"#).is_err());
    }
}
