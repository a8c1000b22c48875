//! Test fingerprints and the append-only test-name registry.
//!
//! A fingerprint is a pair of 64-bit hashes: one for the test path and one for
//! the subtest name, with `0` reserved for "no subtest". Every shard keeps a
//! [`TestRegistry`] mapping the fingerprints it owns back to their names.
//! Entries are never removed, so a fingerprint stays resolvable after every
//! run that mentioned it has been evicted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

/// Identity of a test (`sub_hash == 0`) or of one of its subtests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestFingerprint {
    pub test_hash: u64,
    pub sub_hash: u64,
}

impl TestFingerprint {
    #[must_use]
    pub const fn is_subtest(self) -> bool {
        self.sub_hash != 0
    }

    /// Fingerprint of the enclosing top-level test.
    #[must_use]
    pub const fn test_level(self) -> Self {
        Self {
            test_hash: self.test_hash,
            sub_hash: 0,
        }
    }

    /// Shard owning this fingerprint; subtests share their parent's shard.
    #[must_use]
    pub fn shard(self, shard_count: usize) -> usize {
        (self.test_hash % shard_count.max(1) as u64) as usize
    }
}

impl fmt::Display for TestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:016x}", self.test_hash, self.sub_hash)
    }
}

/// Computes the fingerprint for a test and optional subtest name.
///
/// An empty subtest name is treated as absent. A non-empty subtest name that
/// hashes to `0` cannot be distinguished from "no subtest" and is rejected.
pub fn compute_fingerprint(name: &str, subtest: Option<&str>) -> Result<TestFingerprint> {
    fingerprint_with(xxh3_64, name, subtest)
}

pub(crate) fn fingerprint_with<H>(hash: H, name: &str, subtest: Option<&str>) -> Result<TestFingerprint>
where
    H: Fn(&[u8]) -> u64,
{
    let test_hash = hash(name.as_bytes());
    let sub_hash = match subtest {
        Some(sub) if !sub.is_empty() => {
            let h = hash(sub.as_bytes());
            if h == 0 {
                return Err(Error::ZeroSubtestHash(sub.to_string()));
            }
            h
        }
        _ => 0,
    };
    Ok(TestFingerprint {
        test_hash,
        sub_hash,
    })
}

/// Resolved name of a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestName {
    pub name: Arc<str>,
    pub subtest: Option<Arc<str>>,
}

/// Append-only `fingerprint -> name` mapping for one shard.
#[derive(Debug, Default)]
pub struct TestRegistry {
    names: HashMap<TestFingerprint, TestName>,
}

impl TestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a name. The first name recorded for a fingerprint wins.
    pub fn insert(&mut self, fingerprint: TestFingerprint, name: &str, subtest: Option<&str>) {
        if self.names.contains_key(&fingerprint) {
            return;
        }
        // Subtests reuse the parent's allocation when the parent is known.
        let shared_name = self
            .names
            .get(&fingerprint.test_level())
            .map(|parent| Arc::clone(&parent.name))
            .unwrap_or_else(|| Arc::from(name));
        self.names.insert(
            fingerprint,
            TestName {
                name: shared_name,
                subtest: subtest.filter(|s| !s.is_empty()).map(Arc::from),
            },
        );
    }

    #[must_use]
    pub fn get(&self, fingerprint: TestFingerprint) -> Option<&TestName> {
        self.names.get(&fingerprint)
    }

    pub fn name(&self, fingerprint: TestFingerprint) -> Result<&TestName> {
        self.get(fingerprint)
            .ok_or_else(|| Error::TestNotFound(fingerprint.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TestFingerprint, &TestName)> {
        self.names.iter().map(|(fp, name)| (*fp, name))
    }
}
