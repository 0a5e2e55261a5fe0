//! Lifecycle events and the run reducer

use chrono::{DateTime, Utc};
use std::fmt;
use tracing::warn;

use crate::error::EngineError;
use crate::executor::policy;
use crate::models::{RunContext, RunKey, RunResult, TestRun, TestSuiteRun};

/// Where hook-contributed context lands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeTarget {
    Suite,
    Test { name: String, attempt: u32 },
}

/// A state transition of one suite run
#[derive(Clone, Debug)]
pub enum Event {
    /// Seed the cache entry; any previous state is ignored
    RunStarted { run: TestSuiteRun },
    RunRunning {
        key: RunKey,
        started_at: DateTime<Utc>,
    },
    /// Replace the attempt with the same name and number, or append it
    TestRecorded { test: TestRun },
    SetupFailed { key: RunKey, logs: String },
    RunTimedOut { key: RunKey, message: String },
    RunFinished {
        key: RunKey,
        ended_at: DateTime<Utc>,
    },
    ContextMerged {
        key: RunKey,
        target: MergeTarget,
        context: RunContext,
    },
}

impl Event {
    pub fn key(&self) -> RunKey {
        match self {
            Event::RunStarted { run } => run.key(),
            Event::TestRecorded { test } => test.key(),
            Event::RunRunning { key, .. }
            | Event::SetupFailed { key, .. }
            | Event::RunTimedOut { key, .. }
            | Event::RunFinished { key, .. }
            | Event::ContextMerged { key, .. } => key.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "RunStarted",
            Event::RunRunning { .. } => "RunRunning",
            Event::TestRecorded { .. } => "TestRecorded",
            Event::SetupFailed { .. } => "SetupFailed",
            Event::RunTimedOut { .. } => "RunTimedOut",
            Event::RunFinished { .. } => "RunFinished",
            Event::ContextMerged { .. } => "ContextMerged",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.key())
    }
}

/// Apply `event` to the current state of its run.
///
/// Deterministic: every timestamp comes from the event itself.
pub fn apply(event: &Event, current: Option<TestSuiteRun>) -> Result<TestSuiteRun, EngineError> {
    let mut run = match (event, current) {
        (Event::RunStarted { run }, _) => return Ok(run.clone()),
        (_, Some(run)) => run,
        (_, None) => {
            return Err(EngineError::UnknownRun {
                key: event.key(),
                event: event.kind(),
            })
        }
    };

    match event {
        Event::RunStarted { .. } => {}

        Event::RunRunning { started_at, .. } => {
            run.started_at = Some(*started_at);
        }

        Event::TestRecorded { test } => match run.attempt_mut(&test.name, test.attempt) {
            Some(existing) => *existing = test.clone(),
            None => run.tests.push(test.clone()),
        },

        Event::SetupFailed { logs, .. } => {
            if !run.is_terminal() {
                run.result = RunResult::SetupFailed;
            }
            append_line(&mut run.setup_logs, logs);
            for test in run.tests.iter_mut().filter(|t| t.result == RunResult::Pending) {
                test.result = RunResult::Skipped;
                test.log_line("skipped: suite setup failed");
            }
        }

        Event::RunTimedOut { message, .. } => {
            for test in run.tests.iter_mut().filter(|t| t.result == RunResult::Pending) {
                test.result = RunResult::Failed;
                test.log_line(format!("abandoned: {message}"));
            }
        }

        Event::RunFinished { ended_at, .. } => {
            run.ended_at = Some(*ended_at);
            run.duration_ms = run
                .started_at
                .map(|started| (*ended_at - started).num_milliseconds().max(0) as u64);
            if !run.is_terminal() {
                run.result = match policy::result_from_test_results(&run) {
                    // Attempts left pending never passed.
                    RunResult::Pending => RunResult::Failed,
                    result => result,
                };
            }
            run.flaky = policy::is_flaky(&run);
        }

        Event::ContextMerged { target, context, .. } => match target {
            MergeTarget::Suite => run.context.extend(context.clone()),
            MergeTarget::Test { name, attempt } => {
                let key = run.key();
                match run.attempt_mut(name, *attempt) {
                    Some(test) => test.context.extend(context.clone()),
                    None => warn!(
                        "Dropping context for unknown attempt {}/{} attempt {}",
                        key, name, attempt
                    ),
                }
            }
        },
    }

    Ok(run)
}

fn append_line(buf: &mut String, line: &str) {
    buf.push_str(line);
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunParams, TestSuite};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn seeded() -> TestSuiteRun {
        let suite = TestSuite::builder("reducer")
            .test("a", |_t| async {})
            .soft_test("b", |_t| async {})
            .build()
            .unwrap();
        let params = RunParams::manual().with_max_attempts(2);
        TestSuiteRun::seed(&suite, 1, params, None, at(0))
    }

    fn replay(events: &[Event]) -> TestSuiteRun {
        let mut state = None;
        for event in events {
            state = Some(apply(event, state).unwrap());
        }
        state.unwrap()
    }

    fn finished(run: &TestSuiteRun, name: &str, attempt: u32, result: RunResult) -> TestRun {
        let mut test = run
            .attempt(name, 1)
            .cloned()
            .unwrap_or_else(|| TestRun::pending(&run.key(), name, 1, false));
        test.attempt = attempt;
        test.result = result;
        test
    }

    fn lifecycle() -> Vec<Event> {
        let run = seeded();
        let key = run.key();
        let mut context = RunContext::new();
        context.insert("ticket".to_string(), "OPS-1".into());

        vec![
            Event::RunStarted { run: run.clone() },
            Event::RunRunning {
                key: key.clone(),
                started_at: at(1),
            },
            Event::TestRecorded {
                test: finished(&run, "a", 1, RunResult::Failed),
            },
            Event::TestRecorded {
                test: finished(&run, "a", 2, RunResult::Pending),
            },
            Event::TestRecorded {
                test: finished(&run, "a", 2, RunResult::Passed),
            },
            Event::TestRecorded {
                test: finished(&run, "b", 1, RunResult::Failed),
            },
            Event::RunFinished {
                key: key.clone(),
                ended_at: at(4),
            },
            Event::ContextMerged {
                key,
                target: MergeTarget::Suite,
                context,
            },
        ]
    }

    #[test]
    fn test_full_lifecycle() {
        let run = replay(&lifecycle());
        assert_eq!(run.result, RunResult::Passed);
        assert!(run.flaky);
        assert_eq!(run.duration_ms, Some(3000));
        assert_eq!(run.tests.len(), 3);
        assert_eq!(run.attempts("a").count(), 2);
        assert_eq!(run.context["ticket"], "OPS-1");
    }

    #[test]
    fn test_same_events_yield_identical_aggregates() {
        let first = serde_json::to_string(&replay(&lifecycle())).unwrap();
        let second = serde_json::to_string(&replay(&lifecycle())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_run_started_ignores_prior_state() {
        let mut stale = seeded();
        stale.result = RunResult::Failed;
        let fresh = seeded();
        let run = apply(&Event::RunStarted { run: fresh.clone() }, Some(stale)).unwrap();
        assert_eq!(run, fresh);
    }

    #[test]
    fn test_unknown_run_is_protocol_error() {
        let err = apply(
            &Event::RunFinished {
                key: RunKey::new("ghost", 9),
                ended_at: at(0),
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownRun { event: "RunFinished", .. }));
    }

    #[test]
    fn test_setup_failed_skips_pending_and_sticks() {
        let run = seeded();
        let key = run.key();
        let run = replay(&[
            Event::RunStarted { run },
            Event::SetupFailed {
                key: key.clone(),
                logs: "setup failed: db down".to_string(),
            },
            Event::RunFinished { key, ended_at: at(2) },
        ]);

        assert_eq!(run.result, RunResult::SetupFailed);
        assert_eq!(run.result.reported(), RunResult::Failed);
        assert!(run.setup_logs.contains("db down"));
        assert!(run
            .tests
            .iter()
            .all(|t| t.result == RunResult::Skipped && t.attempt == 1));
        // Never started, so no duration.
        assert_eq!(run.duration_ms, None);
    }

    #[test]
    fn test_timeout_abandons_pending() {
        let run = seeded();
        let key = run.key();
        let first = finished(&run, "a", 1, RunResult::Passed);
        let run = replay(&[
            Event::RunStarted { run },
            Event::TestRecorded { test: first },
            Event::RunTimedOut {
                key: key.clone(),
                message: "suite deadline of 5s exceeded".to_string(),
            },
            Event::RunFinished { key, ended_at: at(5) },
        ]);

        let b = run.attempt("b", 1).unwrap();
        assert_eq!(b.result, RunResult::Failed);
        assert!(b.logs.contains("abandoned"));
        // b is a soft test, so the suite still passes.
        assert_eq!(run.result, RunResult::Passed);
    }

    #[test]
    fn test_context_merge_into_attempt() {
        let run = seeded();
        let key = run.key();
        let mut context = RunContext::new();
        context.insert("pager".to_string(), 200.into());

        let run = replay(&[
            Event::RunStarted { run },
            Event::ContextMerged {
                key: key.clone(),
                target: MergeTarget::Test {
                    name: "a".to_string(),
                    attempt: 1,
                },
                context: context.clone(),
            },
            Event::ContextMerged {
                key,
                target: MergeTarget::Test {
                    name: "a".to_string(),
                    attempt: 7,
                },
                context,
            },
        ]);
        assert_eq!(run.attempt("a", 1).unwrap().context["pager"], 200);
    }
}
