//! Data models for suite runs
//!
//! Static suite definitions, the run aggregate, and the result enum.

mod result;
mod run;
mod suite;

pub use result::RunResult;
pub use run::{RunContext, RunKey, RunParams, RunSummary, TestRun, TestSuiteRun, TriggerSource};
pub use suite::{HookFn, TestDef, TestFn, TestSuite, TestSuiteBuilder};
