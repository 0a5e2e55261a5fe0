//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

/// Run HTTP check suites with retries, hooks and persisted results
#[derive(Parser, Debug)]
#[command(name = "suite-runner")]
#[command(version)]
#[command(about = "Run test suites against live services and keep their results")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one suite and print its result
    Run(RunArgs),

    /// Run suites on their schedule until interrupted
    Serve(ServeArgs),

    /// List configured suites
    List(ListArgs),

    /// View stored runs
    Results(ResultsArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Suite to run
    #[arg(short, long)]
    pub suite: String,

    /// Only run checks whose name matches this regular expression
    #[arg(short = 'F', long)]
    pub filter: Option<String>,

    /// Attempts per check
    #[arg(short = 'a', long)]
    pub max_attempts: Option<u32>,

    /// Whole-suite timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Save the run to file
    #[arg(short, long)]
    pub output: Option<String>,
}

/// Arguments for serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Only schedule these suites (comma-separated)
    #[arg(short, long)]
    pub suites: Option<String>,

    /// Do not resume runs left pending by a previous process
    #[arg(long)]
    pub no_recover: bool,
}

impl ServeArgs {
    pub fn suite_names(&self) -> Option<Vec<String>> {
        self.suites.as_ref().map(|s| {
            s.split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
    }
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Show every check of each suite
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for results command
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Suite whose runs to show
    #[arg(short, long)]
    pub suite: String,

    /// Show a single run
    #[arg(short, long)]
    pub id: Option<u64>,

    /// Show at most this many runs, newest first
    #[arg(short, long, default_value = "20")]
    pub limit: usize,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Export the selected run to a .json or .csv file
    #[arg(short, long)]
    pub export: Option<String>,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write an example configuration file
    Init {
        /// Where to write it
        #[arg(default_value = "./suite-runner.yaml")]
        path: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Describe the environment variables
    Env,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["suite-runner", "list", "--detailed"]);
        match args.command {
            Command::List(list_args) => {
                assert!(list_args.detailed);
            }
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "suite-runner",
            "run",
            "--suite",
            "api-smoke",
            "--filter",
            "^health",
            "--max-attempts",
            "3",
            "-c",
            "custom.yaml",
        ]);
        assert_eq!(args.config.as_deref(), Some("custom.yaml"));
        match args.command {
            Command::Run(run_args) => {
                assert_eq!(run_args.suite, "api-smoke");
                assert_eq!(run_args.filter.as_deref(), Some("^health"));
                assert_eq!(run_args.max_attempts, Some(3));
                assert_eq!(run_args.format, "table");
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_serve_suite_list() {
        let args = Args::parse_from(["suite-runner", "serve", "--suites", "a, b,,c"]);
        match args.command {
            Command::Serve(serve_args) => {
                assert_eq!(
                    serve_args.suite_names(),
                    Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
                );
                assert!(!serve_args.no_recover);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_config_init_default_path() {
        let args = Args::parse_from(["suite-runner", "config", "init"]);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { path, force },
            }) => {
                assert_eq!(path, "./suite-runner.yaml");
                assert!(!force);
            }
            _ => panic!("Expected Config init command"),
        }
    }
}
