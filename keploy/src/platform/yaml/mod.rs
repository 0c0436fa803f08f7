//! YAML persistence: one directory per test set with one file per test case
//! and a multi-document `mocks.yaml`, reports under `testReports/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::debug;

use crate::error::{KeployError, Result};
use crate::models::{
    Mock, RECORD_DIR, TEST_RUN_PATTERN, TEST_SET_PATTERN, TestCase, TestReport,
};
use crate::platform::{MockDb, ReportDb, TestDb};

/// Pick the next free `<prefix><N>` among existing directory names.
pub fn next_indexed_id(existing: &[String], prefix: &str) -> String {
    let next = existing
        .iter()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .map(|n| n + 1)
        .max()
        .unwrap_or(0);
    format!("{prefix}{next}")
}

fn numeric_suffix(name: &str) -> u64 {
    name.rsplit('-')
        .next()
        .and_then(|s| s.split('.').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

async fn list_dirs_matching(root: &Path, prefix: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(_) => return Ok(out),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| KeployError::StoreWrite(e.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.strip_prefix(prefix).is_some_and(|s| s.parse::<u64>().is_ok()) {
            out.push(name);
        }
    }
    out.sort_by_key(|n| numeric_suffix(n));
    Ok(out)
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| KeployError::StoreWrite(format!("read {}: {e}", path.display())))?;
    serde_yaml::from_str(&text)
        .map_err(|e| KeployError::StoreWrite(format!("decode {}: {e}", path.display())))
}

async fn write_yaml<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| KeployError::StoreWrite(format!("mkdir {}: {e}", parent.display())))?;
    }
    let body = serde_yaml::to_string(value)
        .map_err(|e| KeployError::StoreWrite(format!("encode {}: {e}", path.display())))?;
    fs::write(path, body)
        .await
        .map_err(|e| KeployError::StoreWrite(format!("write {}: {e}", path.display())))
}

/// Test cases: `<path>/keploy/test-set-<N>/tests/<name>.yaml`.
pub struct YamlTestDb {
    root: PathBuf,
}

impl YamlTestDb {
    pub fn new(path: &Path) -> Self {
        Self {
            root: path.join(RECORD_DIR),
        }
    }

    fn tests_dir(&self, test_set: &str) -> PathBuf {
        self.root.join(test_set).join("tests")
    }
}

#[async_trait]
impl TestDb for YamlTestDb {
    async fn get_all_test_set_ids(&self) -> Result<Vec<String>> {
        list_dirs_matching(&self.root, TEST_SET_PATTERN).await
    }

    async fn insert_test_case(&self, test_case: &TestCase, test_set: &str) -> Result<()> {
        let path = self
            .tests_dir(test_set)
            .join(format!("{}.yaml", test_case.name));
        write_yaml(&path, test_case).await?;
        debug!(
            event.name = "yaml.test_case_written",
            test_set = %test_set,
            name = %test_case.name,
            "test case persisted"
        );
        Ok(())
    }

    async fn get_test_cases(&self, test_set: &str) -> Result<Vec<TestCase>> {
        let dir = self.tests_dir(test_set);
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KeployError::StoreWrite(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".yaml") {
                names.push(name);
            }
        }
        // stable replay order: test-1, test-2, ... test-10
        names.sort_by_key(|n| numeric_suffix(n));

        let mut cases = Vec::with_capacity(names.len());
        for name in names {
            cases.push(read_yaml(&dir.join(name)).await?);
        }
        Ok(cases)
    }
}

/// Mocks: a multi-document `<path>/keploy/test-set-<N>/mocks.yaml`.
pub struct YamlMockDb {
    root: PathBuf,
}

impl YamlMockDb {
    pub fn new(path: &Path) -> Self {
        Self {
            root: path.join(RECORD_DIR),
        }
    }

    fn mocks_file(&self, test_set: &str) -> PathBuf {
        self.root.join(test_set).join("mocks.yaml")
    }

    async fn read_all(&self, test_set: &str) -> Result<Vec<Mock>> {
        let path = self.mocks_file(test_set);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(_) => return Ok(Vec::new()),
        };
        let mut mocks = Vec::new();
        for document in text.split("\n---\n") {
            let document = document.trim();
            if document.is_empty() || document == "---" {
                continue;
            }
            let mock: Mock = serde_yaml::from_str(document)
                .map_err(|e| KeployError::StoreWrite(format!("decode {}: {e}", path.display())))?;
            mocks.push(mock);
        }
        Ok(mocks)
    }

    async fn write_all(&self, test_set: &str, mocks: &[Mock]) -> Result<()> {
        let path = self.mocks_file(test_set);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KeployError::StoreWrite(e.to_string()))?;
        }
        let mut body = String::new();
        for (i, mock) in mocks.iter().enumerate() {
            if i > 0 {
                body.push_str("\n---\n");
            }
            body.push_str(
                &serde_yaml::to_string(mock)
                    .map_err(|e| KeployError::StoreWrite(e.to_string()))?,
            );
        }
        fs::write(&path, body)
            .await
            .map_err(|e| KeployError::StoreWrite(format!("write {}: {e}", path.display())))
    }
}

#[async_trait]
impl MockDb for YamlMockDb {
    async fn insert_mock(&self, mock: &Mock, test_set: &str) -> Result<()> {
        let mut mocks = self.read_all(test_set).await?;
        mocks.push(mock.clone());
        self.write_all(test_set, &mocks).await
    }

    async fn get_filtered_mocks(
        &self,
        test_set: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<Mock>> {
        Ok(self
            .read_all(test_set)
            .await?
            .into_iter()
            .filter(|m| {
                m.spec.req_timestamp_mock >= after && m.spec.req_timestamp_mock <= before
            })
            .collect())
    }

    async fn get_unfiltered_mocks(
        &self,
        test_set: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<Mock>> {
        Ok(self
            .read_all(test_set)
            .await?
            .into_iter()
            .filter(|m| {
                m.spec.req_timestamp_mock < after || m.spec.req_timestamp_mock > before
            })
            .collect())
    }

    async fn delete_mocks(&self, test_set: &str, names: &[String]) -> Result<()> {
        let remaining: Vec<Mock> = self
            .read_all(test_set)
            .await?
            .into_iter()
            .filter(|m| !names.contains(&m.name))
            .collect();
        self.write_all(test_set, &remaining).await
    }
}

/// Reports: `<path>/keploy/testReports/test-run-<M>/report-<K>.yaml`.
pub struct YamlReportDb {
    root: PathBuf,
}

impl YamlReportDb {
    pub fn new(path: &Path) -> Self {
        Self {
            root: path.join(RECORD_DIR).join("testReports"),
        }
    }

    /// Allocate the next `test-run-<M>` id.
    pub async fn new_test_run_id(&self) -> Result<String> {
        let existing = self.get_all_test_run_ids().await?;
        Ok(next_indexed_id(&existing, TEST_RUN_PATTERN))
    }
}

#[async_trait]
impl ReportDb for YamlReportDb {
    async fn get_all_test_run_ids(&self) -> Result<Vec<String>> {
        list_dirs_matching(&self.root, TEST_RUN_PATTERN).await
    }

    async fn insert_report(
        &self,
        test_run: &str,
        test_set: &str,
        report: &TestReport,
    ) -> Result<()> {
        let index = test_set
            .strip_prefix(TEST_SET_PATTERN)
            .unwrap_or(test_set);
        let path = self
            .root
            .join(test_run)
            .join(format!("report-{index}.yaml"));
        write_yaml(&path, report).await
    }

    async fn get_report(&self, test_run: &str, test_set: &str) -> Result<TestReport> {
        let index = test_set
            .strip_prefix(TEST_SET_PATTERN)
            .unwrap_or(test_set);
        read_yaml(
            &self
                .root
                .join(test_run)
                .join(format!("report-{index}.yaml")),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::models::{HttpReq, HttpResp, Kind, MockSpec, TestCaseSpec};

    fn test_case(name: &str) -> TestCase {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        TestCase::new(
            Kind::Http,
            name,
            TestCaseSpec {
                req: HttpReq {
                    method: "GET".into(),
                    url: "/rows".into(),
                    ..Default::default()
                },
                resp: HttpResp {
                    status_code: 200,
                    body: b"[]".to_vec(),
                    ..Default::default()
                },
                req_timestamp: ts,
                res_timestamp: ts,
                assertions: Default::default(),
                created: ts.timestamp(),
            },
        )
    }

    fn mock(name: &str, minute: u32) -> Mock {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 12, minute, 0).unwrap();
        Mock::new(
            Kind::Http,
            name,
            MockSpec {
                metadata: Default::default(),
                req: HttpReq {
                    method: "GET".into(),
                    url: "/dep".into(),
                    ..Default::default()
                },
                resp: HttpResp::default(),
                req_timestamp_mock: ts,
                res_timestamp_mock: ts,
                created: ts.timestamp(),
            },
        )
    }

    #[test]
    fn indexed_ids_are_monotonic() {
        assert_eq!(next_indexed_id(&[], TEST_SET_PATTERN), "test-set-0");
        let existing = vec!["test-set-0".to_string(), "test-set-3".to_string()];
        assert_eq!(next_indexed_id(&existing, TEST_SET_PATTERN), "test-set-4");
    }

    #[tokio::test]
    async fn test_cases_round_trip_in_stable_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = YamlTestDb::new(dir.path());

        // insert out of order, including a double-digit suffix
        for name in ["test-10", "test-2", "test-1"] {
            db.insert_test_case(&test_case(name), "test-set-0")
                .await
                .unwrap();
        }

        let cases = db.get_test_cases("test-set-0").await.unwrap();
        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["test-1", "test-2", "test-10"]);
        assert_eq!(cases[0], test_case("test-1"));

        assert_eq!(
            db.get_all_test_set_ids().await.unwrap(),
            vec!["test-set-0".to_string()]
        );
    }

    #[tokio::test]
    async fn mocks_round_trip_through_multi_document_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let db = YamlMockDb::new(dir.path());

        db.insert_mock(&mock("mock-1", 0), "test-set-0").await.unwrap();
        db.insert_mock(&mock("mock-2", 30), "test-set-0").await.unwrap();

        let window_start = Utc.with_ymd_and_hms(2024, 2, 1, 11, 55, 0).unwrap();
        let window_end = window_start + Duration::minutes(10);

        let filtered = db
            .get_filtered_mocks("test-set-0", window_start, window_end)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0], mock("mock-1", 0));

        let unfiltered = db
            .get_unfiltered_mocks("test-set-0", window_start, window_end)
            .await
            .unwrap();
        assert_eq!(unfiltered.len(), 1);
        assert_eq!(unfiltered[0].name, "mock-2");
    }

    #[tokio::test]
    async fn unused_mocks_can_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let db = YamlMockDb::new(dir.path());
        db.insert_mock(&mock("mock-1", 0), "test-set-0").await.unwrap();
        db.insert_mock(&mock("mock-2", 1), "test-set-0").await.unwrap();

        db.delete_mocks("test-set-0", &["mock-1".to_string()])
            .await
            .unwrap();
        let left = db.read_all("test-set-0").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "mock-2");
    }

    #[tokio::test]
    async fn reports_land_under_test_run_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db = YamlReportDb::new(dir.path());

        let run = db.new_test_run_id().await.unwrap();
        assert_eq!(run, "test-run-0");

        let report = TestReport::from_results("report-0", Vec::new());
        db.insert_report(&run, "test-set-0", &report).await.unwrap();

        let loaded = db.get_report(&run, "test-set-0").await.unwrap();
        assert_eq!(loaded.total, 0);
        assert_eq!(db.new_test_run_id().await.unwrap(), "test-run-1");

        let path = dir
            .path()
            .join("keploy/testReports/test-run-0/report-0.yaml");
        assert!(path.exists());
    }
}
