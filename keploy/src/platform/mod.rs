//! Persistence boundary. The orchestrators speak to these traits only; the
//! YAML backend underneath writes the on-disk layout users check into their
//! repositories.

pub mod yaml;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Mock, TestCase, TestReport};

#[async_trait]
pub trait TestDb: Send + Sync {
    async fn get_all_test_set_ids(&self) -> Result<Vec<String>>;
    async fn insert_test_case(&self, test_case: &TestCase, test_set: &str) -> Result<()>;
    async fn get_test_cases(&self, test_set: &str) -> Result<Vec<TestCase>>;
}

#[async_trait]
pub trait MockDb: Send + Sync {
    async fn insert_mock(&self, mock: &Mock, test_set: &str) -> Result<()>;
    /// Mocks recorded inside the `[after, before]` window.
    async fn get_filtered_mocks(
        &self,
        test_set: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<Mock>>;
    /// Mocks recorded outside the window.
    async fn get_unfiltered_mocks(
        &self,
        test_set: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<Mock>>;
    async fn delete_mocks(&self, test_set: &str, names: &[String]) -> Result<()>;
}

#[async_trait]
pub trait ReportDb: Send + Sync {
    async fn get_all_test_run_ids(&self) -> Result<Vec<String>>;
    async fn insert_report(
        &self,
        test_run: &str,
        test_set: &str,
        report: &TestReport,
    ) -> Result<()>;
    async fn get_report(&self, test_run: &str, test_set: &str) -> Result<TestReport>;
}
