//! Retry and result policy
//!
//! Pure functions over a run's accumulated attempts. Nothing here performs
//! I/O or reads the clock.

use crate::models::{RunResult, TestRun, TestSuiteRun};

/// Whether `latest` earns another attempt under the run's limit
pub fn should_retry(run: &TestSuiteRun, latest: &TestRun) -> bool {
    latest.result == RunResult::Failed && latest.attempt < run.max_attempts()
}

/// Suite result derived from the latest attempt of every test.
///
/// `Pending` while any latest attempt is still pending.
pub fn result_from_test_results(run: &TestSuiteRun) -> RunResult {
    let latest = run.latest_attempts();

    if latest.iter().any(|t| t.result == RunResult::Pending) {
        return RunResult::Pending;
    }

    let failed = latest
        .iter()
        .any(|t| t.result == RunResult::Failed && !t.soft_failure);

    if failed {
        RunResult::Failed
    } else {
        RunResult::Passed
    }
}

/// A test needed more than one attempt and its latest one passed
pub fn is_flaky(run: &TestSuiteRun) -> bool {
    run.latest_attempts()
        .iter()
        .any(|t| t.attempt > 1 && t.result == RunResult::Passed)
}
