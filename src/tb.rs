//! Test function context
//!
//! [`Tb`] is handed to every test attempt. It records the outcome, log lines
//! and run context. `fail_now`, `fatal` and `skip` stop the attempt from any
//! call depth by unwinding with [`AttemptAborted`], which only the test
//! executor catches.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::models::{RunContext, RunResult};

/// Unwind payload that ends the current attempt intentionally
#[derive(Debug)]
pub(crate) struct AttemptAborted;

#[derive(Debug, Default)]
struct TbState {
    failed: bool,
    skipped: bool,
    soft_failure: bool,
    logs: String,
    context: RunContext,
}

/// What a finished attempt recorded through its context
#[derive(Debug)]
pub(crate) struct TbOutcome {
    pub result: RunResult,
    pub logs: String,
    pub context: RunContext,
    pub soft_failure: bool,
}

/// Capability object for a single test attempt
#[derive(Clone)]
pub struct Tb {
    name: Arc<str>,
    attempt: u32,
    state: Arc<Mutex<TbState>>,
}

impl Tb {
    pub(crate) fn new(name: &str, attempt: u32, soft_failure: bool) -> Self {
        Self {
            name: Arc::from(name),
            attempt,
            state: Arc::new(Mutex::new(TbState {
                soft_failure,
                ..TbState::default()
            })),
        }
    }

    /// Name of the running test
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Append a line to the attempt log
    pub fn log(&self, msg: impl fmt::Display) {
        let mut state = self.state.lock();
        let line = msg.to_string();
        state.logs.push_str(&line);
        if !line.ends_with('\n') {
            state.logs.push('\n');
        }
    }

    /// Log and mark failed, but keep running
    pub fn error(&self, msg: impl fmt::Display) {
        self.log(msg);
        self.fail();
    }

    /// Mark failed, but keep running
    pub fn fail(&self) {
        self.state.lock().failed = true;
    }

    /// Mark failed and stop the attempt
    pub fn fail_now(&self) -> ! {
        self.fail();
        abort_attempt()
    }

    /// Log, mark failed and stop the attempt
    pub fn fatal(&self, msg: impl fmt::Display) -> ! {
        self.log(msg);
        self.fail_now()
    }

    /// Log, mark skipped and stop the attempt
    pub fn skip(&self, msg: impl fmt::Display) -> ! {
        self.log(msg);
        self.skip_now()
    }

    /// Mark skipped and stop the attempt
    pub fn skip_now(&self) -> ! {
        self.state.lock().skipped = true;
        abort_attempt()
    }

    pub fn failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn skipped(&self) -> bool {
        self.state.lock().skipped
    }

    /// Record failures of this attempt as soft: they never fail the suite
    pub fn mark_soft_failure(&self) {
        self.state.lock().soft_failure = true;
    }

    /// Attach a value to the attempt's run context, replacing any previous one
    pub fn set_context(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.state.lock().context.insert(key.into(), value.into());
    }

    pub fn context(&self) -> RunContext {
        self.state.lock().context.clone()
    }

    /// Unexpected defect reached the executor boundary
    pub(crate) fn record_defect(&self, msg: impl fmt::Display) {
        self.error(msg);
    }

    pub(crate) fn finish(&self) -> TbOutcome {
        let state = self.state.lock();
        // A failure recorded before a skip still counts.
        let result = if state.failed {
            RunResult::Failed
        } else if state.skipped {
            RunResult::Skipped
        } else {
            RunResult::Passed
        };

        TbOutcome {
            result,
            logs: state.logs.clone(),
            context: state.context.clone(),
            soft_failure: state.soft_failure,
        }
    }
}

impl fmt::Debug for Tb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tb")
            .field("name", &self.name)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// `resume_unwind` skips the panic hook, so intentional stops stay quiet.
fn abort_attempt() -> ! {
    std::panic::resume_unwind(Box::new(AttemptAborted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_defaults_to_passed() {
        let tb = Tb::new("ok", 1, false);
        tb.log("all good");
        let outcome = tb.finish();
        assert_eq!(outcome.result, RunResult::Passed);
        assert_eq!(outcome.logs, "all good\n");
    }

    #[test]
    fn test_error_keeps_running() {
        let tb = Tb::new("err", 1, false);
        tb.error("first problem");
        tb.log("still here");
        assert!(tb.failed());
        let outcome = tb.finish();
        assert_eq!(outcome.result, RunResult::Failed);
        assert!(outcome.logs.contains("still here"));
    }

    #[test]
    fn test_fatal_unwinds_with_abort_signal() {
        let tb = Tb::new("fatal", 1, false);
        let payload = catch_unwind(AssertUnwindSafe(|| {
            tb.fatal("boom");
        }))
        .unwrap_err();

        assert!(payload.is::<AttemptAborted>());
        assert_eq!(tb.finish().result, RunResult::Failed);
    }

    #[test]
    fn test_skip_unwinds_and_records_skip() {
        let tb = Tb::new("skip", 2, false);
        let payload = catch_unwind(AssertUnwindSafe(|| {
            tb.skip("not applicable");
        }))
        .unwrap_err();

        assert!(payload.is::<AttemptAborted>());
        let outcome = tb.finish();
        assert_eq!(outcome.result, RunResult::Skipped);
        assert!(outcome.logs.contains("not applicable"));
    }

    #[test]
    fn test_failure_wins_over_skip() {
        let tb = Tb::new("both", 1, false);
        tb.fail();
        let _ = catch_unwind(AssertUnwindSafe(|| tb.skip_now()));
        assert_eq!(tb.finish().result, RunResult::Failed);
    }

    #[test]
    fn test_context_and_soft_failure() {
        let tb = Tb::new("ctx", 1, false);
        tb.set_context("trace_id", "abc123");
        tb.set_context("status", 503);
        tb.mark_soft_failure();

        let outcome = tb.finish();
        assert!(outcome.soft_failure);
        assert_eq!(outcome.context["trace_id"], "abc123");
        assert_eq!(outcome.context["status"], 503);
    }
}
