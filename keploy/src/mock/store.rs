use std::sync::RwLock;

use dashmap::DashMap;
use tracing::debug;

use super::matcher::find_best_match;
use crate::models::{HttpReq, Mock};
use crate::runtime::conf::NoiseParams;

/// Per-test-set candidate pools.
///
/// `filtered` holds mocks whose timestamps fall inside the active test
/// case's time window and is always consulted first; `unfiltered` holds the
/// rest of the set. Matched mocks are consumed so N recorded repetitions
/// serve exactly N replayed calls.
struct Pool {
    filtered: Vec<Mock>,
    unfiltered: Vec<Mock>,
    original_filtered: Vec<Mock>,
    original_unfiltered: Vec<Mock>,
    consumed: Vec<String>,
}

/// Indexed recorded mocks for the replay session, keyed by test set.
///
/// One test set is active at a time; the HTTP parser matches against the
/// active set without knowing which one it is.
#[derive(Default)]
pub struct MockStore {
    pools: DashMap<String, Pool>,
    active: RwLock<ActiveState>,
}

#[derive(Default)]
struct ActiveState {
    test_set: String,
    noise: NoiseParams,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the mocks for a test set and make it the active one.
    pub fn set_mocks(
        &self,
        test_set: &str,
        filtered: Vec<Mock>,
        unfiltered: Vec<Mock>,
        noise: NoiseParams,
    ) {
        self.pools.insert(
            test_set.to_string(),
            Pool {
                filtered: filtered.clone(),
                unfiltered: unfiltered.clone(),
                original_filtered: filtered,
                original_unfiltered: unfiltered,
                consumed: Vec::new(),
            },
        );
        let mut active = self.active.write().unwrap();
        active.test_set = test_set.to_string();
        active.noise = noise;
    }

    pub fn active_test_set(&self) -> String {
        self.active.read().unwrap().test_set.clone()
    }

    /// Match an outgoing request against the active test set, preferring the
    /// time-window-filtered pool. A match is consumed from its pool.
    pub fn match_http(&self, req: &HttpReq) -> Option<Mock> {
        let (test_set, noise) = {
            let active = self.active.read().unwrap();
            (active.test_set.clone(), active.noise.clone())
        };
        let mut pool = self.pools.get_mut(&test_set)?;

        for pick_filtered in [true, false] {
            let candidates = if pick_filtered {
                &pool.filtered
            } else {
                &pool.unfiltered
            };
            let refs: Vec<&Mock> = candidates.iter().collect();
            if let Some(found) = find_best_match(req, &refs, &noise) {
                let name = found.name.clone();
                let list = if pick_filtered {
                    &mut pool.filtered
                } else {
                    &mut pool.unfiltered
                };
                let idx = list.iter().position(|m| m.name == name)?;
                let chosen = list.remove(idx);
                pool.consumed.push(chosen.name.clone());
                debug!(
                    event.name = "mock_store.consumed",
                    mock.name = %chosen.name,
                    test_set = %test_set,
                    filtered = pick_filtered,
                    "mock matched and consumed"
                );
                return Some(chosen);
            }
        }
        None
    }

    /// Names of the mocks consumed so far for a test set, in match order.
    pub fn consumed_mocks(&self, test_set: &str) -> Vec<String> {
        self.pools
            .get(test_set)
            .map(|p| p.consumed.clone())
            .unwrap_or_default()
    }

    /// Names of mocks that were never consumed.
    pub fn unused_mocks(&self, test_set: &str) -> Vec<String> {
        self.pools
            .get(test_set)
            .map(|p| {
                p.filtered
                    .iter()
                    .chain(p.unfiltered.iter())
                    .map(|m| m.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Undo consumption for a test set, restoring its full candidate pools.
    pub fn reset(&self, test_set: &str) {
        if let Some(mut pool) = self.pools.get_mut(test_set) {
            pool.filtered = pool.original_filtered.clone();
            pool.unfiltered = pool.original_unfiltered.clone();
            pool.consumed.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::{HttpResp, Kind, MockSpec};

    fn mock(name: &str, url: &str, seconds: u32) -> Mock {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, seconds).unwrap();
        Mock::new(
            Kind::Http,
            name,
            MockSpec {
                metadata: BTreeMap::new(),
                req: HttpReq {
                    method: "GET".into(),
                    url: url.into(),
                    ..Default::default()
                },
                resp: HttpResp {
                    status_code: 200,
                    ..Default::default()
                },
                req_timestamp_mock: ts,
                res_timestamp_mock: ts,
                created: ts.timestamp(),
            },
        )
    }

    fn get(url: &str) -> HttpReq {
        HttpReq {
            method: "GET".into(),
            url: url.into(),
            ..Default::default()
        }
    }

    #[test]
    fn filtered_pool_is_preferred() {
        let store = MockStore::new();
        store.set_mocks(
            "test-set-0",
            vec![mock("in-window", "/rows", 10)],
            vec![mock("out-of-window", "/rows", 0)],
            NoiseParams::new(),
        );

        let chosen = store.match_http(&get("/rows")).expect("match");
        assert_eq!(chosen.name, "in-window");
    }

    #[test]
    fn consumption_caps_matches_at_recorded_multiplicity() {
        let store = MockStore::new();
        store.set_mocks(
            "test-set-0",
            vec![mock("mock-1", "/rows", 1), mock("mock-2", "/rows", 2)],
            Vec::new(),
            NoiseParams::new(),
        );

        // two recorded repetitions serve exactly two replayed calls, in order
        assert_eq!(store.match_http(&get("/rows")).unwrap().name, "mock-1");
        assert_eq!(store.match_http(&get("/rows")).unwrap().name, "mock-2");
        assert!(store.match_http(&get("/rows")).is_none());
        assert_eq!(
            store.consumed_mocks("test-set-0"),
            vec!["mock-1".to_string(), "mock-2".to_string()]
        );
    }

    #[test]
    fn falls_back_to_unfiltered_pool() {
        let store = MockStore::new();
        store.set_mocks(
            "test-set-0",
            vec![mock("filtered", "/other", 1)],
            vec![mock("unfiltered", "/rows", 2)],
            NoiseParams::new(),
        );

        assert_eq!(store.match_http(&get("/rows")).unwrap().name, "unfiltered");
    }

    #[test]
    fn reset_restores_consumed_mocks() {
        let store = MockStore::new();
        store.set_mocks(
            "test-set-0",
            vec![mock("mock-1", "/rows", 1)],
            Vec::new(),
            NoiseParams::new(),
        );
        assert!(store.match_http(&get("/rows")).is_some());
        assert!(store.match_http(&get("/rows")).is_none());

        store.reset("test-set-0");
        assert!(store.match_http(&get("/rows")).is_some());
        assert!(store.consumed_mocks("test-set-0").len() == 1);
    }

    #[test]
    fn unused_mocks_are_reported() {
        let store = MockStore::new();
        store.set_mocks(
            "test-set-0",
            vec![mock("used", "/rows", 1), mock("never", "/cols", 2)],
            Vec::new(),
            NoiseParams::new(),
        );
        store.match_http(&get("/rows"));
        assert_eq!(store.unused_mocks("test-set-0"), vec!["never".to_string()]);
    }

    #[test]
    fn switching_test_sets_switches_candidates() {
        let store = MockStore::new();
        store.set_mocks(
            "test-set-0",
            vec![mock("zero", "/rows", 1)],
            Vec::new(),
            NoiseParams::new(),
        );
        store.set_mocks(
            "test-set-1",
            vec![mock("one", "/rows", 1)],
            Vec::new(),
            NoiseParams::new(),
        );

        assert_eq!(store.active_test_set(), "test-set-1");
        assert_eq!(store.match_http(&get("/rows")).unwrap().name, "one");
    }
}
