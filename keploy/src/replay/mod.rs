//! Replay orchestrator: boots the interceptor in test mode, re-issues each
//! recorded test case at the application, and reports per-case verdicts.

mod diff;
mod simulate;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::core::Core;
use crate::error::{KeployError, Result};
use crate::models::{
    Mode, TEST_RUN_PATTERN, TEST_SET_PATTERN, TestReport, TestResult, TestStatus,
};
use crate::platform::yaml::next_indexed_id;
use crate::platform::{MockDb, ReportDb, TestDb};
use crate::runtime::component::{ComponentManager, Handle};
use crate::runtime::conf::Config;
use crate::runtime::shutdown::ShutdownConfig;
use crate::telemetry::Telemetry;

pub use diff::{DiffOutcome, diff_responses};
pub use simulate::simulate_http;

/// Slack added around a test set's recorded time window when selecting
/// filtered mocks.
fn window_epsilon() -> chrono::Duration {
    chrono::Duration::seconds(10)
}

pub struct Replayer {
    core: Arc<Core>,
    test_db: Arc<dyn TestDb>,
    mock_db: Arc<dyn MockDb>,
    report_db: Arc<dyn ReportDb>,
    telemetry: Arc<dyn Telemetry>,
    config: Config,
}

impl Replayer {
    pub fn new(
        core: Arc<Core>,
        test_db: Arc<dyn TestDb>,
        mock_db: Arc<dyn MockDb>,
        report_db: Arc<dyn ReportDb>,
        telemetry: Arc<dyn Telemetry>,
        config: Config,
    ) -> Self {
        Self {
            core,
            test_db,
            mock_db,
            report_db,
            telemetry,
            config,
        }
    }

    /// Which test sets this run covers: the `--testsets` selection when
    /// given, otherwise everything on disk.
    async fn selected_test_sets(&self) -> Result<Vec<String>> {
        let all = self.test_db.get_all_test_set_ids().await?;
        let selected = &self.config.test.selected_tests;
        if selected.is_empty() {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|set| selected.contains(set))
            .collect())
    }

    /// Run every selected test set; returns `true` iff all of them passed.
    pub async fn start(&self) -> Result<bool> {
        let test_sets = self.selected_test_sets().await?;
        if test_sets.is_empty() {
            warn!(event.name = "replay.no_test_sets", "nothing to replay");
            return Ok(true);
        }

        let runs = self.report_db.get_all_test_run_ids().await?;
        let test_run = next_indexed_id(&runs, TEST_RUN_PATTERN);
        info!(
            event.name = "replay.started",
            test_run = %test_run,
            test_sets = test_sets.len(),
            "starting test run"
        );

        let app_id = self.core.setup(&self.config.command);
        let mut manager = ComponentManager::new();
        if let Err(e) = self.core.hook(app_id, Mode::Test, &mut manager).await {
            manager.shutdown(ShutdownConfig::default()).await;
            return Err(e);
        }

        let core = self.core.clone();
        let shutdown = manager.subscribe();
        manager.register(Handle::new(
            "app",
            tokio::spawn(async move {
                let _ = core.run(app_id, shutdown).await;
            }),
        ));

        // give the application time to boot before hitting it
        tokio::time::sleep(Duration::from_secs(self.config.test.delay)).await;

        let mut success = 0usize;
        let mut failure = 0usize;
        for test_set in &test_sets {
            let report = self.run_test_set(test_set, &test_run).await?;
            if report.failure == 0 {
                success += 1;
            } else {
                failure += 1;
            }
        }

        manager.shutdown(ShutdownConfig::default()).await;
        if let Err(e) = self.core.unload().await {
            warn!(
                event.name = "replay.unload_failed",
                error.message = %e,
                "failed to unload hooks"
            );
        }

        let all_passed = failure == 0;
        self.telemetry.test_run(
            success,
            failure,
            test_sets.len(),
            if all_passed { "PASSED" } else { "FAILED" },
        );
        self.telemetry.flush();
        info!(
            event.name = "replay.finished",
            test_run = %test_run,
            passed_sets = success,
            failed_sets = failure,
            "test run finished"
        );
        Ok(all_passed)
    }

    async fn run_test_set(&self, test_set: &str, test_run: &str) -> Result<TestReport> {
        let cases = self.test_db.get_test_cases(test_set).await?;
        info!(
            event.name = "replay.test_set_started",
            test_set = %test_set,
            cases = cases.len(),
            "replaying test set"
        );

        // freeze the set's time window and install its mocks
        let after = cases
            .iter()
            .map(|c| c.spec.req_timestamp)
            .min()
            .map(|t| t - window_epsilon())
            .unwrap_or_else(Utc::now);
        let before = cases
            .iter()
            .map(|c| c.spec.res_timestamp)
            .max()
            .map(|t| t + window_epsilon())
            .unwrap_or_else(Utc::now);

        let filtered = self
            .mock_db
            .get_filtered_mocks(test_set, after, before)
            .await?;
        let unfiltered = self
            .mock_db
            .get_unfiltered_mocks(test_set, after, before)
            .await?;
        let noise = self.config.noise_for(test_set);
        self.core
            .set_mocks(test_set, filtered, unfiltered, noise.clone());

        let mut results = Vec::with_capacity(cases.len());
        for case in &cases {
            let started = Utc::now();
            let outcome = match simulate_http(
                case,
                self.config.port as u16,
                self.config.api_timeout(),
            )
            .await
            {
                Ok(actual) => {
                    let mut case_noise = noise.clone();
                    case_noise.extend(case.spec.assertions.clone());
                    diff::diff_responses(
                        &case.spec.resp,
                        &actual,
                        &case_noise,
                        self.config.test.ignore_ordering,
                    )
                }
                Err(e) => {
                    warn!(
                        event.name = "replay.case_failed_to_run",
                        test = %case.name,
                        error.message = %e,
                        "test case could not be executed"
                    );
                    diff::diff_responses(
                        &case.spec.resp,
                        &Default::default(),
                        &noise,
                        self.config.test.ignore_ordering,
                    )
                }
            };

            let status = if outcome.passed {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            };
            info!(
                event.name = "replay.case_finished",
                test = %case.name,
                status = ?status,
                "test case finished"
            );
            results.push(TestResult {
                kind: case.kind,
                name: case.name.clone(),
                status,
                started,
                completed: Utc::now(),
                status_code: outcome.status_code,
                headers_result: outcome.headers,
                body_result: outcome.body,
            });
        }

        let index = test_set.strip_prefix(TEST_SET_PATTERN).unwrap_or(test_set);
        let report = TestReport::from_results(format!("report-{index}"), results);
        self.report_db
            .insert_report(test_run, test_set, &report)
            .await?;

        if self.config.test.remove_unused_mocks {
            let unused = self.core.unused_mocks(test_set);
            if !unused.is_empty() {
                info!(
                    event.name = "replay.removing_unused_mocks",
                    test_set = %test_set,
                    count = unused.len(),
                    "deleting mocks the run never consumed"
                );
                self.mock_db.delete_mocks(test_set, &unused).await?;
            }
        }

        self.telemetry.test_set_run(
            report.success,
            report.failure,
            test_set,
            if report.failure == 0 { "PASSED" } else { "FAILED" },
        );
        Ok(report)
    }

    /// `serve` / `mock test`: boot the interceptor with recorded mocks
    /// installed and hold until interrupted, for externally driven runs.
    pub async fn serve(&self, mock_set: &str) -> Result<()> {
        let app_id = self.core.setup(&self.config.command);
        let mut manager = ComponentManager::new();
        if let Err(e) = self.core.hook(app_id, Mode::Test, &mut manager).await {
            manager.shutdown(ShutdownConfig::default()).await;
            return Err(e);
        }

        // the full recorded window: everything is "filtered"
        let filtered = self
            .mock_db
            .get_filtered_mocks(
                mock_set,
                chrono::DateTime::<Utc>::MIN_UTC,
                chrono::DateTime::<Utc>::MAX_UTC,
            )
            .await?;
        info!(
            event.name = "serve.mocks_installed",
            mock_set = %mock_set,
            count = filtered.len(),
            "serving recorded mocks"
        );
        self.core
            .set_mocks(mock_set, filtered, Vec::new(), self.config.noise_for(mock_set));

        let core = self.core.clone();
        let shutdown = manager.subscribe();
        manager.register(Handle::new(
            "app",
            tokio::spawn(async move {
                let _ = core.run(app_id, shutdown).await;
            }),
        ));

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| KeployError::internal(format!("failed to listen for interrupt: {e}")))?;
        info!(event.name = "serve.interrupted", "interrupt received, stopping");

        manager.shutdown(ShutdownConfig::default()).await;
        let _ = self.core.unload().await;
        self.telemetry.flush();
        Ok(())
    }
}
