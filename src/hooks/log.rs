//! Logging hook

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Hook, SuiteFinishedHook, TestFinishedHook};
use crate::models::{RunResult, TestRun, TestSuite, TestSuiteRun};

/// Writes every finished attempt and run to the log
#[derive(Clone, Debug, Default)]
pub struct LogHook {
    /// Include attempt logs of failed tests
    pub verbose: bool,
}

impl LogHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl Hook for LogHook {
    fn name(&self) -> &str {
        "log"
    }
}

#[async_trait]
impl TestFinishedHook for LogHook {
    async fn test_finished(&self, suite: &TestSuite, run: &TestSuiteRun, test: &TestRun) {
        match test.result {
            RunResult::Failed if !test.soft_failure => {
                warn!(suite = %suite.name, run_id = run.id, "  {}", test);
                if self.verbose && !test.logs.is_empty() {
                    warn!("    {}", test.logs.trim_end().replace('\n', "\n    "));
                }
            }
            _ => info!(suite = %suite.name, run_id = run.id, "  {}", test),
        }
    }
}

#[async_trait]
impl SuiteFinishedHook for LogHook {
    async fn suite_finished(&self, suite: &TestSuite, run: &TestSuiteRun) {
        let summary = run.summary();
        info!(
            suite = %suite.name,
            run_id = run.id,
            "{} {} - {}/{} passed ({:.1}%){}",
            run.result.reported().symbol(),
            run.key(),
            summary.passed,
            summary.total,
            summary.pass_rate(),
            if run.flaky { " [flaky]" } else { "" }
        );
        if run.result == RunResult::SetupFailed {
            warn!("  {}", run.setup_logs.trim_end());
        }
    }
}
