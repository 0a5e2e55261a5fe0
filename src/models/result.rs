//! Run and attempt results
//!
//! The closed set of outcomes shared by suite runs and test attempts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a suite run or of a single test attempt
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    #[default]
    Pending,
    Passed,
    Failed,
    Skipped,
    SetupFailed,
}

impl RunResult {
    pub fn symbol(&self) -> &'static str {
        match self {
            RunResult::Pending => "…",
            RunResult::Passed => "✓",
            RunResult::Failed => "✗",
            RunResult::Skipped => "○",
            RunResult::SetupFailed => "!",
        }
    }

    /// Anything but `Pending`. Terminal results never regress.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunResult::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Passed)
    }

    /// Result as reported to callers and metrics: a failed setup is a failure.
    pub fn reported(&self) -> RunResult {
        match self {
            RunResult::SetupFailed => RunResult::Failed,
            other => *other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Pending => "pending",
            RunResult::Passed => "passed",
            RunResult::Failed => "failed",
            RunResult::Skipped => "skipped",
            RunResult::SetupFailed => "setup_failed",
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Pending => write!(f, "PENDING"),
            RunResult::Passed => write!(f, "PASS"),
            RunResult::Failed => write!(f, "FAIL"),
            RunResult::Skipped => write!(f, "SKIP"),
            RunResult::SetupFailed => write!(f, "SETUP FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_results() {
        assert!(!RunResult::Pending.is_terminal());
        assert!(RunResult::Passed.is_terminal());
        assert!(RunResult::SetupFailed.is_terminal());
    }

    #[test]
    fn test_setup_failed_reported_as_failed() {
        assert_eq!(RunResult::SetupFailed.reported(), RunResult::Failed);
        assert_eq!(RunResult::Skipped.reported(), RunResult::Skipped);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&RunResult::SetupFailed).unwrap();
        assert_eq!(json, "\"setup_failed\"");
        let parsed: RunResult = serde_json::from_str("\"passed\"").unwrap();
        assert_eq!(parsed, RunResult::Passed);
    }
}
