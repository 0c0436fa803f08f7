use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HttpReq, HttpResp, Kind, VERSION};

/// One recorded outgoing interaction, replayed as a dependency stub.
///
/// A mock and an interaction are the same shape; the name only records where
/// it came from (persisted during record, consumed during replay).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mock {
    pub version: String,
    pub kind: Kind,
    pub name: String,
    pub spec: MockSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MockSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub req: HttpReq,
    pub resp: HttpResp,
    #[serde(rename = "reqTimestampMock")]
    pub req_timestamp_mock: DateTime<Utc>,
    #[serde(rename = "resTimestampMock")]
    pub res_timestamp_mock: DateTime<Utc>,
    pub created: i64,
}

impl Mock {
    pub fn new(kind: Kind, name: impl Into<String>, spec: MockSpec) -> Self {
        Self {
            version: VERSION.to_string(),
            kind,
            name: name.into(),
            spec,
        }
    }
}

/// One recorded inbound interaction, re-issued at the application under
/// replay and diffed against its recorded response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub version: String,
    pub kind: Kind,
    pub name: String,
    pub spec: TestCaseSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCaseSpec {
    pub req: HttpReq,
    pub resp: HttpResp,
    #[serde(rename = "reqTimestamp")]
    pub req_timestamp: DateTime<Utc>,
    #[serde(rename = "resTimestamp")]
    pub res_timestamp: DateTime<Utc>,
    /// Per-case noise: field paths excluded from matching and diffing, in
    /// addition to the configured global noise.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assertions: BTreeMap<String, Vec<String>>,
    pub created: i64,
}

impl TestCase {
    pub fn new(kind: Kind, name: impl Into<String>, spec: TestCaseSpec) -> Self {
        Self {
            version: VERSION.to_string(),
            kind,
            name: name.into(),
            spec,
        }
    }
}
