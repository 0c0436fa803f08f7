use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Kind, VERSION};

/// Verdict for one replayed test case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Aggregate verdict for a test set (or a whole run).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Passed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCodeResult {
    pub normal: bool,
    pub expected: u16,
    pub actual: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderResult {
    pub normal: bool,
    pub key: String,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyResult {
    pub normal: bool,
    pub expected: String,
    pub actual: String,
}

/// Diff outcome for one replayed test case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub kind: Kind,
    pub name: String,
    pub status: TestStatus,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub status_code: StatusCodeResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers_result: Vec<HeaderResult>,
    pub body_result: BodyResult,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

/// Per-test-set aggregate written under `testReports/test-run-<M>/`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub version: String,
    pub name: String,
    pub status: ReportStatus,
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    #[serde(rename = "testsResult", default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestResult>,
}

impl TestReport {
    /// Build a report from collected results; status is PASSED iff no case
    /// failed.
    pub fn from_results(name: impl Into<String>, tests: Vec<TestResult>) -> Self {
        let total = tests.len();
        let success = tests.iter().filter(|t| t.passed()).count();
        let failure = total - success;
        Self {
            version: VERSION.to_string(),
            name: name.into(),
            status: if failure == 0 {
                ReportStatus::Passed
            } else {
                ReportStatus::Failed
            },
            total,
            success,
            failure,
            tests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: TestStatus) -> TestResult {
        TestResult {
            kind: Kind::Http,
            name: name.into(),
            status,
            started: Utc::now(),
            completed: Utc::now(),
            status_code: StatusCodeResult {
                normal: status == TestStatus::Passed,
                expected: 200,
                actual: 200,
            },
            headers_result: Vec::new(),
            body_result: BodyResult {
                normal: true,
                expected: "[]".into(),
                actual: "[]".into(),
            },
        }
    }

    #[test]
    fn report_aggregates_counts() {
        let report = TestReport::from_results(
            "report-1",
            vec![
                result("test-1", TestStatus::Passed),
                result("test-2", TestStatus::Failed),
                result("test-3", TestStatus::Passed),
            ],
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.success, 2);
        assert_eq!(report.failure, 1);
        assert_eq!(report.status, ReportStatus::Failed);
    }

    #[test]
    fn all_passed_report_is_passed() {
        let report = TestReport::from_results("report-2", vec![result("t", TestStatus::Passed)]);
        assert_eq!(report.status, ReportStatus::Passed);
    }

    #[test]
    fn status_serializes_screaming() {
        let yaml = serde_yaml::to_string(&TestStatus::Passed).unwrap();
        assert_eq!(yaml.trim(), "PASSED");
    }
}
