//! Test metadata (triage links, labels) and web-features data.
//!
//! Metadata arrives as a table keyed by test path. A key ending in `*` is a
//! wildcard covering every test sharing the prefix (`/css/grid/*`). Binding a
//! metadata-scoped atom flattens the relevant slice of the table into
//! [`PathValues`], which the filter consults per test.
//!
//! The tables themselves live in owned caches ([`MetadataCache`],
//! [`WebFeaturesCache`]) that are injected into the binder and refreshed by
//! the poll loop from an upstream source.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::run::{ProductSpec, TestRun};

/// One metadata entry attached to a test path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataLink {
    /// `None` for test-level metadata not tied to a browser.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtest: Option<String>,
}

impl MetadataLink {
    #[must_use]
    pub fn url(product: Option<ProductSpec>, url: impl Into<String>) -> Self {
        Self {
            product,
            url: Some(url.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    fn non_empty_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }
}

/// `test path -> metadata entries`.
pub type MetadataTable = BTreeMap<String, Vec<MetadataLink>>;

/// `test path -> web feature ids`.
pub type WebFeaturesData = HashMap<String, HashSet<String>>;

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Values attached to test paths, with wildcard-prefix support.
///
/// Path comparison is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathValues {
    exact: HashMap<String, Vec<String>>,
    prefixes: BTreeMap<String, Vec<String>>,
}

impl PathValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, value: impl Into<String>) {
        let key = path.to_lowercase();
        let bucket = match key.strip_suffix('*') {
            Some(prefix) => self.prefixes.entry(prefix.to_string()).or_default(),
            None => self.exact.entry(key).or_default(),
        };
        bucket.push(value.into());
    }

    /// Every value attached to `test`, exact entries first.
    #[must_use]
    pub fn values_for(&self, test: &str) -> Vec<&str> {
        let key = test.to_lowercase();
        let mut out: Vec<&str> = self
            .exact
            .get(&key)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        for (prefix, values) in &self.prefixes {
            if key.starts_with(prefix.as_str()) {
                out.extend(values.iter().map(String::as_str));
            }
        }
        out
    }

    #[must_use]
    pub fn any_value(&self, test: &str, pred: impl Fn(&str) -> bool) -> bool {
        self.values_for(test).into_iter().any(pred)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    /// Number of distinct path keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }
}

/// Which entries of a table a binding should see.
#[derive(Debug, Clone, Copy)]
pub enum LinkScope<'a> {
    /// Entries without a product.
    TestLevel,
    /// Entries whose product matches one of the runs.
    Runs(&'a [TestRun]),
    /// Both of the above.
    TestLevelAndRuns(&'a [TestRun]),
}

impl LinkScope<'_> {
    fn admits(&self, link: &MetadataLink) -> bool {
        match (self, &link.product) {
            (Self::TestLevel | Self::TestLevelAndRuns(_), None) => true,
            (Self::Runs(runs) | Self::TestLevelAndRuns(runs), Some(product)) => {
                runs.iter().any(|run| product.matches(run))
            }
            _ => false,
        }
    }
}

/// Non-empty link URLs visible in `scope`, keyed by path.
#[must_use]
pub fn link_values(table: &MetadataTable, scope: LinkScope<'_>) -> PathValues {
    let mut values = PathValues::new();
    for (path, links) in table {
        for link in links.iter().filter(|l| scope.admits(l)) {
            if let Some(url) = link.non_empty_url() {
                values.insert(path, url);
            }
        }
    }
    values
}

/// Labels from test-level entries, keyed by path.
#[must_use]
pub fn label_values(table: &MetadataTable) -> PathValues {
    let mut values = PathValues::new();
    for (path, links) in table {
        for link in links.iter().filter(|l| LinkScope::TestLevel.admits(l)) {
            if let Some(label) = link.label.as_deref().filter(|l| !l.is_empty()) {
                values.insert(path, label);
            }
        }
    }
    values
}

/// Whether `test` is tagged with `feature`. Both sides compare exactly.
#[must_use]
pub fn test_has_feature(data: &WebFeaturesData, test: &str, feature: &str) -> bool {
    data.get(test).is_some_and(|features| features.contains(feature))
}

// ---------------------------------------------------------------------------
// Fetchers and caches
// ---------------------------------------------------------------------------

/// Supplies the current metadata table during binding.
pub trait MetadataFetcher: Send + Sync {
    fn fetch(&self) -> Result<Arc<MetadataTable>>;
}

/// Supplies the current web-features data during binding.
pub trait WebFeaturesFetcher: Send + Sync {
    fn fetch(&self) -> Result<Arc<WebFeaturesData>>;
}

/// Owned, lock-guarded holder of the latest metadata table.
#[derive(Debug, Default)]
pub struct MetadataCache {
    table: RwLock<Arc<MetadataTable>>,
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> Arc<MetadataTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set(&self, table: MetadataTable) {
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }
}

impl MetadataFetcher for MetadataCache {
    fn fetch(&self) -> Result<Arc<MetadataTable>> {
        Ok(self.get())
    }
}

/// Owned, lock-guarded holder of the latest web-features data.
#[derive(Debug, Default)]
pub struct WebFeaturesCache {
    data: RwLock<Arc<WebFeaturesData>>,
}

impl WebFeaturesCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> Arc<WebFeaturesData> {
        Arc::clone(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set(&self, data: WebFeaturesData) {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(data);
    }
}

impl WebFeaturesFetcher for WebFeaturesCache {
    fn fetch(&self) -> Result<Arc<WebFeaturesData>> {
        Ok(self.get())
    }
}

// ---------------------------------------------------------------------------
// Upstream sources
// ---------------------------------------------------------------------------

/// Upstream supplier of the metadata table, polled to refresh the cache.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self) -> Result<MetadataTable>;
}

/// Upstream supplier of web-features data.
#[async_trait]
pub trait WebFeaturesSource: Send + Sync {
    async fn fetch_web_features(&self) -> Result<WebFeaturesData>;
}

/// Reads a JSON metadata table from `{base_url}/api/metadata/cache`.
#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    client: reqwest::Client,
    url: String,
}

impl HttpMetadataSource {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/metadata/cache", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch_metadata(&self) -> Result<MetadataTable> {
        let table = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<MetadataTable>()
            .await?;
        Ok(table)
    }
}

/// Web-features manifest shape: `{"version": 1, "data": {feature: [test path]}}`.
#[derive(Debug, Deserialize)]
struct WebFeaturesManifest {
    version: u32,
    #[serde(default)]
    data: HashMap<String, Vec<String>>,
}

/// Inverts a version-1 web-features manifest into `test -> features`.
pub fn parse_web_features_manifest(bytes: &[u8]) -> Result<WebFeaturesData> {
    let manifest: WebFeaturesManifest = serde_json::from_slice(bytes)?;
    if manifest.version != 1 {
        return Err(Error::Upstream(format!(
            "unknown web features manifest version {}",
            manifest.version
        )));
    }
    let mut data = WebFeaturesData::new();
    for (feature, tests) in manifest.data {
        for test in tests {
            data.entry(test).or_default().insert(feature.clone());
        }
    }
    Ok(data)
}

/// Downloads and parses a web-features manifest from a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpWebFeaturesSource {
    client: reqwest::Client,
    url: String,
}

impl HttpWebFeaturesSource {
    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl WebFeaturesSource for HttpWebFeaturesSource {
    async fn fetch_web_features(&self) -> Result<WebFeaturesData> {
        let bytes = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_web_features_manifest(&bytes)
    }
}
