//! Test run metadata and product specs.
//!
//! A [`TestRun`] is the metadata record for one uploaded run; the index keys
//! its result store by [`RunId`]. A [`ProductSpec`] is the user-facing way
//! of selecting runs (`chrome-69[experimental]@abcdef0123`).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Externally assigned run identifier. `0` means "no identity".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl RunId {
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RunId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Metadata for a single test run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRun {
    pub id: RunId,
    pub browser_name: String,
    pub browser_version: String,
    pub os_name: String,
    pub os_version: String,
    /// First 10 characters of the WPT commit the run was produced from.
    pub revision: String,
    pub full_revision_hash: String,
    pub results_url: String,
    pub raw_results_url: String,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
}

impl TestRun {
    #[must_use]
    pub fn new(id: i64, browser_name: impl Into<String>) -> Self {
        Self {
            id: RunId(id),
            browser_name: browser_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_start(mut self, time_start: DateTime<Utc>) -> Self {
        self.time_start = time_start;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.browser_version = version.into();
        self
    }

    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Revision placeholder meaning "any revision".
pub const LATEST_REVISION: &str = "latest";

/// A browser/version/OS selector optionally pinned to labels and a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductSpec {
    pub browser_name: String,
    pub browser_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub labels: BTreeSet<String>,
    /// Either [`LATEST_REVISION`] or a 10-character SHA prefix.
    pub revision: String,
}

impl ProductSpec {
    /// Bare browser-name spec matching every run of that browser.
    #[must_use]
    pub fn browser(name: impl Into<String>) -> Self {
        Self {
            browser_name: name.into().to_ascii_lowercase(),
            browser_version: None,
            os_name: None,
            os_version: None,
            labels: BTreeSet::new(),
            revision: LATEST_REVISION.to_string(),
        }
    }

    /// Whether `run` is selected by this spec.
    ///
    /// The version compares on dotted boundaries: `6` matches `6.1` but not
    /// `60.1`.
    #[must_use]
    pub fn matches(&self, run: &TestRun) -> bool {
        if run.browser_name != self.browser_name {
            return false;
        }
        if self.revision != LATEST_REVISION && self.revision != run.revision {
            return false;
        }
        if !self.labels.iter().all(|label| run.has_label(label)) {
            return false;
        }
        if let Some(version) = &self.browser_version {
            let run_version = format!("{}.", run.browser_version);
            if !run_version.starts_with(&format!("{version}.")) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for ProductSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.browser_name)?;
        for part in [&self.browser_version, &self.os_name, &self.os_version]
            .into_iter()
            .flatten()
        {
            write!(f, "-{part}")?;
        }
        if !self.labels.is_empty() {
            let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
            write!(f, "[{}]", labels.join(","))?;
        }
        if self.revision != LATEST_REVISION {
            write!(f, "@{}", self.revision)?;
        }
        Ok(())
    }
}

/// Syntax: `name[-version[-os[-osversion]]][label,...][@sha]`.
impl FromStr for ProductSpec {
    type Err = QueryError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = || QueryError::InvalidProduct(spec.to_string());

        let mut name = spec;
        let mut revision = LATEST_REVISION.to_string();
        let mut at_pieces = spec.split('@');
        let head = at_pieces.next().unwrap_or_default();
        if let Some(sha) = at_pieces.next() {
            if at_pieces.next().is_some() {
                return Err(invalid());
            }
            name = head;
            revision = parse_sha(sha).ok_or_else(invalid)?;
        }

        let mut labels = BTreeSet::new();
        if let Some((product, rest)) = name.split_once('[') {
            let inner = rest.strip_suffix(']').ok_or_else(invalid)?;
            if inner.contains('[') || inner.contains(']') {
                return Err(invalid());
            }
            labels = inner
                .split(',')
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            name = product;
        }

        let pieces: Vec<&str> = name.split('-').collect();
        if pieces.len() > 4 {
            return Err(invalid());
        }
        let browser_name = pieces[0].to_ascii_lowercase();
        if !is_browser_name(&browser_name) {
            return Err(invalid());
        }
        let browser_version = match pieces.get(1) {
            Some(v) if is_version(v) => Some((*v).to_string()),
            Some(_) => return Err(invalid()),
            None => None,
        };
        let os_name = pieces.get(2).map(|s| (*s).to_string());
        let os_version = match pieces.get(3) {
            Some(v) if is_version(v) => Some((*v).to_string()),
            Some(_) => return Err(invalid()),
            None => None,
        };

        Ok(Self {
            browser_name,
            browser_version,
            os_name,
            os_version,
            labels,
            revision,
        })
    }
}

impl TryFrom<String> for ProductSpec {
    type Error = QueryError;

    fn try_from(spec: String) -> Result<Self, Self::Error> {
        spec.parse()
    }
}

impl From<ProductSpec> for String {
    fn from(spec: ProductSpec) -> Self {
        spec.to_string()
    }
}

fn is_browser_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Dotted numeric version, optionally followed by a channel word
/// (`"63.0 beta"`) or a pre-release suffix (`"59.0a1"`).
fn is_version(version: &str) -> bool {
    let mut words = version.split(' ');
    let number = words.next().unwrap_or_default();
    if words.count() > 1 {
        return false;
    }
    number.starts_with(|c: char| c.is_ascii_digit())
        && number
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Validates a 10-40 hex character SHA and crops it to 10 characters.
fn parse_sha(sha: &str) -> Option<String> {
    if sha.is_empty() || sha == LATEST_REVISION {
        return Some(LATEST_REVISION.to_string());
    }
    let valid = (10..=40).contains(&sha.len()) && sha.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| sha[..10].to_string())
}
