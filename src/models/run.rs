//! Suite run aggregate and per-attempt test records
//!
//! These types are what the dispatcher mutates and what storage persists.
//! All maps are ordered so serialized runs are byte-stable.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use super::{RunResult, TestSuite};

/// Free-form metadata contributed by tests and hooks
pub type RunContext = BTreeMap<String, serde_json::Value>;

/// Identity of a suite run
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub suite: String,
    pub id: u64,
}

impl RunKey {
    pub fn new(suite: impl Into<String>, id: u64) -> Self {
        Self {
            suite: suite.into(),
            id,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.suite, self.id)
    }
}

/// What caused a run to be created
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Http,
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Http => write!(f, "http"),
            TriggerSource::Scheduled => write!(f, "scheduled"),
            TriggerSource::Manual => write!(f, "manual"),
        }
    }
}

/// Trigger parameters of a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub trigger: TriggerSource,
    /// Regular expression selecting which tests run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl RunParams {
    pub fn new(trigger: TriggerSource) -> Self {
        Self {
            trigger,
            filter: None,
            max_attempts: None,
            timeout_secs: None,
        }
    }

    pub fn http(filter: Option<String>) -> Self {
        Self {
            filter,
            ..Self::new(TriggerSource::Http)
        }
    }

    pub fn scheduled() -> Self {
        Self::new(TriggerSource::Scheduled)
    }

    pub fn manual() -> Self {
        Self::new(TriggerSource::Manual)
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Fill unset values from the suite definition, then from engine defaults
    pub fn resolve(
        mut self,
        suite: &TestSuite,
        default_max_attempts: u32,
        default_timeout_secs: Option<u64>,
    ) -> Self {
        self.max_attempts = Some(
            self.max_attempts
                .or(suite.max_attempts)
                .unwrap_or(default_max_attempts)
                .max(1),
        );
        self.timeout_secs = self
            .timeout_secs
            .or_else(|| suite.timeout.map(|t| t.as_secs().max(1)))
            .or(default_timeout_secs);
        self
    }
}

/// One attempt of one test inside a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub suite: String,
    pub run_id: u64,
    pub name: String,
    /// 1-based, contiguous per test name
    pub attempt: u32,
    pub result: RunResult,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: RunContext,
    #[serde(default)]
    pub soft_failure: bool,
}

impl TestRun {
    pub fn pending(key: &RunKey, name: impl Into<String>, attempt: u32, soft_failure: bool) -> Self {
        Self {
            suite: key.suite.clone(),
            run_id: key.id,
            name: name.into(),
            attempt,
            result: RunResult::Pending,
            logs: String::new(),
            duration_ms: 0,
            started_at: None,
            context: RunContext::new(),
            soft_failure,
        }
    }

    /// Fresh pending record for the following attempt of the same test
    pub fn next_attempt(&self) -> Self {
        Self::pending(
            &self.key(),
            self.name.clone(),
            self.attempt + 1,
            self.soft_failure,
        )
    }

    pub fn key(&self) -> RunKey {
        RunKey::new(self.suite.clone(), self.run_id)
    }

    /// Append a line to the attempt's log
    pub fn log_line(&mut self, line: impl AsRef<str>) {
        self.logs.push_str(line.as_ref());
        if !self.logs.ends_with('\n') {
            self.logs.push('\n');
        }
    }
}

impl fmt::Display for TestRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (attempt {}) [{}ms]",
            self.result.symbol(),
            self.name,
            self.attempt,
            self.duration_ms
        )?;
        if self.soft_failure {
            write!(f, " [soft]")?;
        }
        Ok(())
    }
}

/// Aggregate root: one triggered execution of a suite
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestSuiteRun {
    pub id: u64,
    pub suite: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub params: RunParams,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub result: RunResult,
    #[serde(default)]
    pub setup_logs: String,
    #[serde(default)]
    pub flaky: bool,
    /// Suite-level context contributed by suite-finished hooks
    #[serde(default)]
    pub context: RunContext,
    /// One record per attempt, in insertion order
    #[serde(default)]
    pub tests: Vec<TestRun>,
}

impl TestSuiteRun {
    /// Seed a run with every selected test pending at attempt 1.
    ///
    /// Tests not matching `filter` are never instantiated.
    pub fn seed(
        suite: &TestSuite,
        id: u64,
        params: RunParams,
        filter: Option<&Regex>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let key = RunKey::new(suite.name.clone(), id);
        let tests = suite
            .tests
            .iter()
            .filter(|t| filter.map(|re| re.is_match(&t.name)).unwrap_or(true))
            .map(|t| TestRun::pending(&key, t.name.clone(), 1, t.soft_failure))
            .collect();

        Self {
            id,
            suite: suite.name.clone(),
            service: suite.service.clone(),
            params,
            scheduled_at,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            result: RunResult::Pending,
            setup_logs: String::new(),
            flaky: false,
            context: RunContext::new(),
            tests,
        }
    }

    pub fn key(&self) -> RunKey {
        RunKey::new(self.suite.clone(), self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.result.is_terminal()
    }

    pub fn max_attempts(&self) -> u32 {
        self.params.max_attempts.unwrap_or(1).max(1)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.params.timeout_secs.map(Duration::from_secs)
    }

    pub fn attempt(&self, name: &str, attempt: u32) -> Option<&TestRun> {
        self.tests
            .iter()
            .find(|t| t.name == name && t.attempt == attempt)
    }

    pub fn attempt_mut(&mut self, name: &str, attempt: u32) -> Option<&mut TestRun> {
        self.tests
            .iter_mut()
            .find(|t| t.name == name && t.attempt == attempt)
    }

    pub fn attempts<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TestRun> + 'a {
        self.tests.iter().filter(move |t| t.name == name)
    }

    /// Latest attempt of every test, in first-seen order
    pub fn latest_attempts(&self) -> Vec<&TestRun> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut latest: Vec<&TestRun> = Vec::new();

        for test in &self.tests {
            match index.get(test.name.as_str()) {
                Some(&i) => {
                    if test.attempt > latest[i].attempt {
                        latest[i] = test;
                    }
                }
                None => {
                    index.insert(test.name.as_str(), latest.len());
                    latest.push(test);
                }
            }
        }

        latest
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_run(self)
    }
}

/// Counts over the latest attempt of every test
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub attempts: usize,
}

impl RunSummary {
    pub fn from_run(run: &TestSuiteRun) -> Self {
        let mut summary = Self {
            attempts: run.tests.len(),
            ..Self::default()
        };
        for test in run.latest_attempts() {
            summary.total += 1;
            match test.result {
                RunResult::Passed => summary.passed += 1,
                RunResult::Failed | RunResult::SetupFailed => summary.failed += 1,
                RunResult::Skipped => summary.skipped += 1,
                RunResult::Pending => summary.pending += 1,
            }
        }
        summary
    }

    pub fn pass_rate(&self) -> f64 {
        let counted = self.total - self.skipped;
        if counted == 0 {
            0.0
        } else {
            (self.passed as f64 / counted as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite() -> TestSuite {
        TestSuite::builder("api")
            .service("payments")
            .test("health", |_t| async {})
            .test("login", |_t| async {})
            .soft_test("latency", |_t| async {})
            .max_attempts(2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_seed_all_pending() {
        let run = TestSuiteRun::seed(&suite(), 7, RunParams::manual(), None, Utc::now());
        assert_eq!(run.key(), RunKey::new("api", 7));
        assert_eq!(run.tests.len(), 3);
        assert!(run.tests.iter().all(|t| t.result == RunResult::Pending && t.attempt == 1));
        assert!(run.tests[2].soft_failure);
        assert_eq!(run.service.as_deref(), Some("payments"));
    }

    #[test]
    fn test_seed_with_filter_skips_instantiation() {
        let re = Regex::new("^l").unwrap();
        let run = TestSuiteRun::seed(&suite(), 1, RunParams::manual(), Some(&re), Utc::now());
        let names: Vec<_> = run.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["login", "latency"]);
    }

    #[test]
    fn test_resolve_params() {
        let s = suite();
        let params = RunParams::http(None).resolve(&s, 1, Some(60));
        assert_eq!(params.max_attempts, Some(2));
        assert_eq!(params.timeout_secs, Some(60));

        let params = RunParams::scheduled().with_max_attempts(5).resolve(&s, 1, None);
        assert_eq!(params.max_attempts, Some(5));
        assert_eq!(params.timeout_secs, None);
    }

    #[test]
    fn test_latest_attempts() {
        let mut run = TestSuiteRun::seed(&suite(), 1, RunParams::manual(), None, Utc::now());
        run.tests[0].result = RunResult::Failed;
        let retry = run.tests[0].next_attempt();
        run.tests.push(retry);

        let latest = run.latest_attempts();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].name, "health");
        assert_eq!(latest[0].attempt, 2);
        assert_eq!(run.attempts("health").count(), 2);
    }

    #[test]
    fn test_summary_counts() {
        let mut run = TestSuiteRun::seed(&suite(), 1, RunParams::manual(), None, Utc::now());
        run.tests[0].result = RunResult::Passed;
        run.tests[1].result = RunResult::Failed;
        run.tests[2].result = RunResult::Skipped;

        let summary = run.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pass_rate(), 50.0);
    }

    #[test]
    fn test_log_line_appends_newline() {
        let key = RunKey::new("api", 1);
        let mut test = TestRun::pending(&key, "health", 1, false);
        test.log_line("first");
        test.log_line("second\n");
        assert_eq!(test.logs, "first\nsecond\n");
    }
}
