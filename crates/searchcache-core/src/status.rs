//! Test result status codes.
//!
//! Codes are stable integers shared with the results producer, so the
//! discriminants are part of the data format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::QueryError;

/// Outcome of a single test or subtest in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum TestStatus {
    /// No result recorded.
    #[default]
    Unknown = 0,
    Pass = 1,
    Ok = 2,
    Error = 3,
    Timeout = 4,
    NotRun = 5,
    Fail = 6,
    Crash = 7,
    Skip = 8,
    Assert = 9,
}

impl TestStatus {
    pub const ALL: [Self; 10] = [
        Self::Unknown,
        Self::Pass,
        Self::Ok,
        Self::Error,
        Self::Timeout,
        Self::NotRun,
        Self::Fail,
        Self::Crash,
        Self::Skip,
        Self::Assert,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Pass => "PASS",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NotRun => "NOTRUN",
            Self::Fail => "FAIL",
            Self::Crash => "CRASH",
            Self::Skip => "SKIP",
            Self::Assert => "ASSERT",
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Out-of-range codes read as `Unknown`.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .unwrap_or(Self::Unknown)
    }

    /// Lenient conversion used for report ingestion: names are matched
    /// exactly and anything unrecognised becomes `Unknown`.
    #[must_use]
    pub fn from_report_str(s: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .unwrap_or(Self::Unknown)
    }

    #[must_use]
    pub const fn is_pass_or_ok(self) -> bool {
        matches!(self, Self::Pass | Self::Ok)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict, case-insensitive parse used by query atoms.
impl FromStr for TestStatus {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| QueryError::InvalidStatus(s.to_string()))
    }
}

impl Serialize for TestStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TestStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_report_str(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_values() {
        assert_eq!(TestStatus::Unknown.code(), 0);
        assert_eq!(TestStatus::Pass.code(), 1);
        assert_eq!(TestStatus::Ok.code(), 2);
        assert_eq!(TestStatus::Fail.code(), 6);
        assert_eq!(TestStatus::Assert.code(), 9);
        for status in TestStatus::ALL {
            assert_eq!(TestStatus::from_code(status.code()), status);
        }
        assert_eq!(TestStatus::from_code(200), TestStatus::Unknown);
    }

    #[test]
    fn query_parse_is_case_insensitive_and_strict() {
        assert_eq!("pass".parse::<TestStatus>(), Ok(TestStatus::Pass));
        assert_eq!("NotRun".parse::<TestStatus>(), Ok(TestStatus::NotRun));
        assert_eq!("unknown".parse::<TestStatus>(), Ok(TestStatus::Unknown));
        assert_eq!(
            "PASSED".parse::<TestStatus>(),
            Err(QueryError::InvalidStatus("PASSED".into()))
        );
    }

    #[test]
    fn report_parse_is_lenient() {
        assert_eq!(TestStatus::from_report_str("TIMEOUT"), TestStatus::Timeout);
        assert_eq!(TestStatus::from_report_str("timeout"), TestStatus::Unknown);
        assert_eq!(
            TestStatus::from_report_str("PRECONDITION_FAILED"),
            TestStatus::Unknown
        );
    }

    #[test]
    fn pass_or_ok() {
        let passing: Vec<_> = TestStatus::ALL
            .into_iter()
            .filter(|s| s.is_pass_or_ok())
            .collect();
        assert_eq!(passing, vec![TestStatus::Pass, TestStatus::Ok]);
    }

    #[test]
    fn serde_uses_names() {
        let json = serde_json::to_string(&TestStatus::Crash).unwrap();
        assert_eq!(json, "\"CRASH\"");
        let back: TestStatus = serde_json::from_str("\"SKIP\"").unwrap();
        assert_eq!(back, TestStatus::Skip);
        let odd: TestStatus = serde_json::from_str("\"NEW_STATUS\"").unwrap();
        assert_eq!(odd, TestStatus::Unknown);
    }
}
