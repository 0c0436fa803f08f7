//! Telemetry facade. The actual ping transport lives outside the core; the
//! orchestrators only need somewhere to report session counters and a flush
//! point in the shutdown order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

pub trait Telemetry: Send + Sync {
    fn recorded_test_and_mocks(&self) {}
    fn recorded_test_suite(&self, _test_set: &str, _test_count: usize, _mock_count: usize) {}
    fn test_set_run(&self, _success: usize, _failure: usize, _test_set: &str, _status: &str) {}
    fn test_run(&self, _success: usize, _failure: usize, _test_sets: usize, _status: &str) {}
    fn flush(&self) {}
}

/// Used when the user passes `--disableTele`.
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

/// Counts session events and reports them at flush time.
#[derive(Default)]
pub struct SessionTelemetry {
    tests_recorded: AtomicUsize,
}

impl Telemetry for SessionTelemetry {
    fn recorded_test_and_mocks(&self) {
        self.tests_recorded.fetch_add(1, Ordering::Relaxed);
    }

    fn recorded_test_suite(&self, test_set: &str, test_count: usize, mock_count: usize) {
        debug!(
            event.name = "telemetry.recorded_suite",
            test_set = %test_set,
            tests = test_count,
            mocks = mock_count,
            "recorded test suite"
        );
    }

    fn test_set_run(&self, success: usize, failure: usize, test_set: &str, status: &str) {
        debug!(
            event.name = "telemetry.test_set_run",
            test_set = %test_set,
            success = success,
            failure = failure,
            status = %status,
            "test set finished"
        );
    }

    fn test_run(&self, success: usize, failure: usize, test_sets: usize, status: &str) {
        debug!(
            event.name = "telemetry.test_run",
            success = success,
            failure = failure,
            test_sets = test_sets,
            status = %status,
            "test run finished"
        );
    }

    fn flush(&self) {
        debug!(
            event.name = "telemetry.flush",
            tests_recorded = self.tests_recorded.load(Ordering::Relaxed),
            "telemetry flushed"
        );
    }
}

pub fn for_session(disabled: bool) -> Arc<dyn Telemetry> {
    if disabled {
        Arc::new(NoopTelemetry)
    } else {
        Arc::new(SessionTelemetry::default())
    }
}
