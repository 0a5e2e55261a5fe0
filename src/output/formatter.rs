//! Output formatters for suite runs
//!
//! Provides table, JSON, CSV, and one-line summary output.

use serde::Serialize;
use std::io::Write;

use crate::models::{RunResult, TestRun, TestSuiteRun};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Format one suite run
    pub fn format_run(&self, run: &TestSuiteRun) -> String {
        match self.format {
            OutputFormat::Table => self.format_run_table(run),
            OutputFormat::Json => to_json(run, false),
            OutputFormat::JsonPretty => to_json(run, true),
            OutputFormat::Csv => self.format_run_csv(run),
            OutputFormat::Summary => self.format_run_brief(run),
        }
    }

    /// Format a list of runs, newest first
    pub fn format_runs(&self, runs: &[TestSuiteRun]) -> String {
        match self.format {
            OutputFormat::Json => to_json(runs, false),
            OutputFormat::JsonPretty => to_json(runs, true),
            OutputFormat::Csv => {
                let mut output = String::from("suite,run_id,result,flaky,passed,total,duration_ms,scheduled_at\n");
                for run in runs {
                    let summary = run.summary();
                    output.push_str(&format!(
                        "{},{},{},{},{},{},{},{}\n",
                        run.suite,
                        run.id,
                        run.result.as_str(),
                        run.flaky,
                        summary.passed,
                        summary.total,
                        run.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
                        run.scheduled_at.to_rfc3339()
                    ));
                }
                output
            }
            OutputFormat::Table | OutputFormat::Summary => runs
                .iter()
                .map(|run| self.format_run_brief(run))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn status(&self, result: RunResult) -> String {
        let label = format!("{} {}", result.symbol(), result);
        if !self.colorize {
            return label;
        }
        let color = match result {
            RunResult::Passed => "32",
            RunResult::Failed | RunResult::SetupFailed => "31",
            RunResult::Skipped | RunResult::Pending => "33",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    fn format_test_row(&self, test: &TestRun) -> String {
        format!(
            "{:28} #{:<2} {:16} [{:>6}ms]{}",
            test.name,
            test.attempt,
            self.status(test.result),
            test.duration_ms,
            if test.soft_failure { " soft" } else { "" }
        )
    }

    fn format_run_table(&self, run: &TestSuiteRun) -> String {
        let mut output = String::new();
        let summary = run.summary();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!(" Suite {} - run {} ({})\n", run.suite, run.id, run.params.trigger));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        if !run.setup_logs.is_empty() {
            for line in run.setup_logs.lines() {
                output.push_str(&format!("  setup: {line}\n"));
            }
        }

        for test in &run.tests {
            output.push_str(&format!("  {}\n", self.format_test_row(test)));
            if test.result == RunResult::Failed {
                for line in test.logs.lines() {
                    output.push_str(&format!("      {line}\n"));
                }
            }
        }

        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        output.push_str(&format!(
            "  Result: {} | Pass: {}/{} | Skip: {} | Attempts: {}{}\n",
            self.status(run.result),
            summary.passed,
            summary.total,
            summary.skipped,
            summary.attempts,
            if run.flaky { " | flaky" } else { "" }
        ));
        if let Some(duration) = run.duration_ms {
            output.push_str(&format!(
                "  Pass Rate: {:5.1}% | Duration: {}ms\n",
                summary.pass_rate(),
                duration
            ));
        }
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_run_csv(&self, run: &TestSuiteRun) -> String {
        let mut output = String::from("test,attempt,result,soft_failure,duration_ms,logs\n");
        for test in &run.tests {
            output.push_str(&format!(
                "{},{},{},{},{},\"{}\"\n",
                test.name,
                test.attempt,
                test.result.as_str(),
                test.soft_failure,
                test.duration_ms,
                test.logs.trim_end().replace('"', "\"\"")
            ));
        }
        output
    }

    fn format_run_brief(&self, run: &TestSuiteRun) -> String {
        let summary = run.summary();
        format!(
            "{} {}: {}/{} passed ({:.1}%){}{}",
            run.key(),
            self.status(run.result),
            summary.passed,
            summary.total,
            summary.pass_rate(),
            run.duration_ms
                .map(|d| format!(" in {d}ms"))
                .unwrap_or_default(),
            if run.flaky { " [flaky]" } else { "" }
        )
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    rendered.unwrap_or_default()
}

/// Write a formatted run to a file
pub fn write_run_to_file(path: &str, run: &TestSuiteRun, format: OutputFormat) -> anyhow::Result<()> {
    let formatter = ResultFormatter::new(format).no_color();
    let content = formatter.format_run(run);

    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunParams, TestSuite};
    use chrono::Utc;

    fn run() -> TestSuiteRun {
        let suite = TestSuite::builder("fmt")
            .test("login", |_t| async {})
            .soft_test("latency", |_t| async {})
            .build()
            .unwrap();
        let mut run = TestSuiteRun::seed(&suite, 2, RunParams::scheduled(), None, Utc::now());
        run.tests[0].result = RunResult::Passed;
        run.tests[1].result = RunResult::Failed;
        run.tests[1].log_line("p99 \"slow\"");
        run.result = RunResult::Passed;
        run.duration_ms = Some(120);
        run
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("TABLE"), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::parse("unknown"), None);
    }

    #[test]
    fn test_table_lists_attempts_and_failure_logs() {
        let output = ResultFormatter::new(OutputFormat::Table).no_color().format_run(&run());
        assert!(output.contains("Suite fmt - run 2 (scheduled)"));
        assert!(output.contains("login"));
        assert!(output.contains("p99"));
        assert!(output.contains("soft"));
    }

    #[test]
    fn test_summary_line() {
        let output = ResultFormatter::new(OutputFormat::Summary).no_color().format_run(&run());
        assert_eq!(output, "fmt#2 ✓ PASS: 1/2 passed (50.0%) in 120ms");
    }

    #[test]
    fn test_csv_escapes_quotes() {
        let output = ResultFormatter::new(OutputFormat::Csv).format_run(&run());
        assert!(output.starts_with("test,attempt,result"));
        assert!(output.contains("\"p99 \"\"slow\"\"\""));
    }

    #[test]
    fn test_json_round_trips() {
        let output = ResultFormatter::new(OutputFormat::Json).format_run(&run());
        let parsed: TestSuiteRun = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed, run_with_same_time(&parsed));
    }

    fn run_with_same_time(parsed: &TestSuiteRun) -> TestSuiteRun {
        let mut expected = run();
        expected.scheduled_at = parsed.scheduled_at;
        expected
    }
}
