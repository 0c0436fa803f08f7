//! Persisted record shapes: interactions, mocks, test cases, and reports.

mod http;
mod mock;
mod report;

use serde::{Deserialize, Serialize};

pub use http::{HeaderMap, HttpReq, HttpResp};
pub use mock::{Mock, MockSpec, TestCase, TestCaseSpec};
pub use report::{
    BodyResult, HeaderResult, ReportStatus, StatusCodeResult, TestReport, TestResult, TestStatus,
};

/// Schema version stamped on every persisted record.
pub const VERSION: &str = "api.keploy.io/v1beta1";

/// Directory (under the user path) holding recorded artifacts.
pub const RECORD_DIR: &str = "keploy";

/// Prefix of generated test-set directories (`test-set-0`, `test-set-1`, ...).
pub const TEST_SET_PATTERN: &str = "test-set-";

/// Prefix of generated test-run report directories.
pub const TEST_RUN_PATTERN: &str = "test-run-";

/// Wire protocol family of an interaction.
///
/// Only protocols with a registered parser produce structured interactions;
/// the remaining kinds exist so recorded artifacts stay forward-compatible
/// when parsers for them are registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Http,
    #[serde(rename = "MySQL")]
    Mysql,
    Mongo,
    Postgres,
    Redis,
    #[serde(rename = "gRPC")]
    Grpc,
    #[serde(rename = "DNS")]
    Dns,
    Generic,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Kind::Http => "Http",
            Kind::Mysql => "MySQL",
            Kind::Mongo => "Mongo",
            Kind::Postgres => "Postgres",
            Kind::Redis => "Redis",
            Kind::Grpc => "gRPC",
            Kind::Dns => "DNS",
            Kind::Generic => "Generic",
        };
        f.write_str(name)
    }
}

/// Session mode, threaded through every parser entry point.
///
/// There is deliberately no process-global mode: each proxied connection
/// captures the mode it was accepted under, so concurrent record and replay
/// sessions cannot observe each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Record,
    Test,
}
