//! Run metrics
//!
//! In-process counters for running suites and finished suites/tests,
//! labeled by service, suite and result. Exporting them is left to the
//! embedding application through [`Metrics::snapshot`].

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::models::RunResult;

/// Label set shared by the run counters
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricLabels {
    pub service: String,
    pub suite: String,
    pub result: RunResult,
}

impl MetricLabels {
    pub fn new(service: impl Into<String>, suite: impl Into<String>, result: RunResult) -> Self {
        Self {
            service: service.into(),
            suite: suite.into(),
            result,
        }
    }
}

/// Counter registry owned by one engine instance
#[derive(Debug, Default)]
pub struct Metrics {
    suites_running: AtomicI64,
    suites_run_total: DashMap<MetricLabels, u64>,
    tests_run_total: DashMap<MetricLabels, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the running gauge until the returned guard drops
    pub fn suite_running(self: &Arc<Self>) -> RunningSuite {
        self.suites_running.fetch_add(1, Ordering::AcqRel);
        RunningSuite {
            metrics: self.clone(),
        }
    }

    pub fn record_suite(&self, service: &str, suite: &str, result: RunResult) {
        *self
            .suites_run_total
            .entry(MetricLabels::new(service, suite, result.reported()))
            .or_insert(0) += 1;
    }

    pub fn record_test(&self, service: &str, suite: &str, result: RunResult) {
        *self
            .tests_run_total
            .entry(MetricLabels::new(service, suite, result))
            .or_insert(0) += 1;
    }

    pub fn suites_running(&self) -> i64 {
        self.suites_running.load(Ordering::Acquire)
    }

    pub fn suites_run(&self, labels: &MetricLabels) -> u64 {
        self.suites_run_total.get(labels).map(|v| *v).unwrap_or(0)
    }

    pub fn tests_run(&self, labels: &MetricLabels) -> u64 {
        self.tests_run_total.get(labels).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            suites_running: self.suites_running(),
            suites_run_total: collect(&self.suites_run_total),
            tests_run_total: collect(&self.tests_run_total),
        }
    }
}

fn collect(counters: &DashMap<MetricLabels, u64>) -> BTreeMap<MetricLabels, u64> {
    counters
        .iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect()
}

/// Guard that keeps a suite counted in the running gauge
#[derive(Debug)]
pub struct RunningSuite {
    metrics: Arc<Metrics>,
}

impl Drop for RunningSuite {
    fn drop(&mut self) {
        self.metrics.suites_running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time copy of all counters
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub suites_running: i64,
    #[serde(serialize_with = "serialize_counters")]
    pub suites_run_total: BTreeMap<MetricLabels, u64>,
    #[serde(serialize_with = "serialize_counters")]
    pub tests_run_total: BTreeMap<MetricLabels, u64>,
}

#[derive(Serialize)]
struct CounterSample<'a> {
    #[serde(flatten)]
    labels: &'a MetricLabels,
    value: u64,
}

// JSON object keys must be strings, so counters serialize as a sample list.
fn serialize_counters<S>(counters: &BTreeMap<MetricLabels, u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(
        counters
            .iter()
            .map(|(labels, value)| CounterSample { labels, value: *value }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_gauge_follows_guards() {
        let metrics = Arc::new(Metrics::new());
        let first = metrics.suite_running();
        let second = metrics.suite_running();
        assert_eq!(metrics.suites_running(), 2);
        drop(first);
        drop(second);
        assert_eq!(metrics.suites_running(), 0);
    }

    #[test]
    fn test_suite_counter_reports_setup_failed_as_failed() {
        let metrics = Metrics::new();
        metrics.record_suite("shop", "checkout", RunResult::SetupFailed);
        metrics.record_suite("shop", "checkout", RunResult::Failed);

        let failed = MetricLabels::new("shop", "checkout", RunResult::Failed);
        assert_eq!(metrics.suites_run(&failed), 2);
    }

    #[test]
    fn test_snapshot_serializes_as_samples() {
        let metrics = Metrics::new();
        metrics.record_test("shop", "checkout", RunResult::Passed);
        metrics.record_test("shop", "checkout", RunResult::Passed);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["tests_run_total"][0]["value"], 2);
        assert_eq!(json["tests_run_total"][0]["result"], "passed");
    }
}
