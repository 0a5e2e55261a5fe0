//! suite-runner - run test suites against live services
//!
//! Suites of HTTP checks are declared in a configuration file. Each run is
//! retried per check, persisted, and reported to the configured webhooks.
//!
//! ## Usage
//!
//! ```bash
//! # Write an example configuration
//! suite-runner config init
//!
//! # Run one suite now
//! suite-runner run --suite api-smoke --max-attempts 3
//!
//! # Run only some checks
//! suite-runner run --suite api-smoke --filter '^health'
//!
//! # Run every scheduled suite until Ctrl-C
//! suite-runner serve
//!
//! # Show stored runs and export one
//! suite-runner results --suite api-smoke
//! suite-runner results --suite api-smoke --id 12 --export run-12.csv
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;
use suite_runner::checks::build_suite;
use suite_runner::config::env::{print_env_help, EnvConfig};
use suite_runner::config::{AppConfig, StorageBackend};
use suite_runner::hooks::{HookRegistration, LogHook, WebhookHook};
use suite_runner::output::{write_run_to_file, OutputFormat, ResultFormatter};
use suite_runner::storage::{export_run, ExportFormat, JsonStorage, MemoryStorage, Storage};
use suite_runner::utils::logger::{init_logger, LogLevel};
use suite_runner::{Engine, EngineBuilder, EngineError, RunParams, RunResult};

/// How long `run` waits for a suite that sets no timeout of its own
const RUN_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval at which `serve` retries failed final writes
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();
    let config = load_config(&args, &env)?;

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config
            .log_level
            .as_deref()
            .and_then(LogLevel::from_str)
            .unwrap_or(LogLevel::Info)
    };
    init_logger(level);

    match args.command {
        cli::Command::Run(run_args) => {
            run_suite(run_args, &config, args.verbose).await?;
        }
        cli::Command::Serve(serve_args) => {
            serve(serve_args, &config, args.verbose).await?;
        }
        cli::Command::List(list_args) => {
            list_suites(list_args, &config);
        }
        cli::Command::Results(results_args) => {
            show_results(results_args, &config).await?;
        }
        cli::Command::Config(config_args) => {
            manage_config(config_args, &config, &env)?;
        }
    }

    Ok(())
}

/// File from the flag, then the environment, then the standard locations
fn load_config(args: &Args, env: &EnvConfig) -> Result<AppConfig> {
    let mut config = match args.config.as_ref().or(env.config_file.as_ref()) {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_default()?,
    };
    env.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn open_storage(config: &AppConfig) -> Arc<dyn Storage> {
    match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Json => Arc::new(JsonStorage::new(config.storage.resolved_dir())),
    }
}

async fn build_engine(config: &AppConfig, verbose: bool) -> Result<Engine> {
    let mut builder = EngineBuilder::new(config.engine.clone()).storage(open_storage(config));

    for suite in &config.suites {
        builder = builder.suite(build_suite(suite)?);
    }

    builder = builder.hook(
        HookRegistration::new(LogHook::new().verbose(verbose))
            .on_test_finished()
            .on_suite_finished(),
    );
    for hook in &config.hooks {
        let webhook = WebhookHook::with_timeout(hook.name.clone(), hook.url.clone(), hook.timeout_secs)?;
        builder = builder.hook(HookRegistration::new(webhook).on_suite_finished_async());
    }

    Ok(builder.build().await?)
}

fn parse_format(format: &str) -> Result<OutputFormat> {
    OutputFormat::parse(format).ok_or_else(|| anyhow!("Unknown output format: {format}"))
}

async fn run_suite(args: cli::RunArgs, config: &AppConfig, verbose: bool) -> Result<()> {
    let format = parse_format(&args.format)?;
    if config.suite(&args.suite).is_none() {
        bail!("Suite '{}' is not configured", args.suite);
    }

    let mut params = RunParams::manual();
    if let Some(filter) = args.filter {
        params = params.with_filter(filter);
    }
    if let Some(attempts) = args.max_attempts {
        params = params.with_max_attempts(attempts);
    }
    if let Some(timeout) = args.timeout {
        params = params.with_timeout_secs(timeout);
    }

    let engine = build_engine(config, verbose).await?;
    let key = engine.trigger(&args.suite, params).await?;
    engine.wait_for(&key, RUN_WAIT).await?;

    // Let hooks contribute their context before printing.
    engine.shutdown().await?;
    let run = engine.run(&key.suite, key.id).await?;

    println!("{}", ResultFormatter::new(format).format_run(&run));

    if let Some(path) = args.output {
        write_run_to_file(&path, &run, format)?;
        info!("Run saved to {}", path);
    }

    if run.result.reported() == RunResult::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(args: cli::ServeArgs, config: &AppConfig, verbose: bool) -> Result<()> {
    let engine = Arc::new(build_engine(config, verbose).await?);

    if !args.no_recover {
        let resumed = engine.recover_pending().await?;
        if resumed > 0 {
            info!("Resumed {} interrupted runs", resumed);
        }
    }

    let selected = args.suite_names();
    let mut tasks = Vec::new();

    for suite in &config.suites {
        if let Some(names) = &selected {
            if !names.contains(&suite.name) {
                continue;
            }
        }
        let Some(secs) = suite.schedule_secs else {
            debug!("Suite {} has no schedule", suite.name);
            continue;
        };

        let engine = engine.clone();
        let name = suite.name.clone();
        info!("Scheduling {} every {}s", name, secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            loop {
                ticker.tick().await;
                match engine.trigger(&name, RunParams::scheduled()).await {
                    Ok(key) => debug!("Scheduled run {}", key),
                    Err(EngineError::ShuttingDown) => break,
                    Err(e) => warn!("Scheduled run of {} not started: {}", name, e),
                }
            }
        }));
    }

    if tasks.is_empty() {
        warn!("No scheduled suites selected; only resumed runs will execute");
    }

    let flusher = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                ticker.tick().await;
                match engine.flush().await {
                    Ok(0) => {}
                    Ok(n) => info!("Flushed {} finished runs", n),
                    Err(e) => warn!("Flush failed: {}", e),
                }
            }
        })
    };

    info!("Serving {} scheduled suites; press Ctrl-C to stop", tasks.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupt received, shutting down");

    engine.shutdown().await?;
    flusher.abort();
    for task in tasks {
        task.abort();
    }

    Ok(())
}

fn list_suites(args: cli::ListArgs, config: &AppConfig) {
    println!("\nConfigured Suites ({} total)\n", config.suites.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for suite in &config.suites {
        let schedule = suite
            .schedule_secs
            .map(|s| format!("every {s}s"))
            .unwrap_or_else(|| "manual".to_string());
        println!(
            "  {:24} {:3} checks  [{}]{}",
            suite.name,
            suite.checks.len(),
            schedule,
            suite
                .service
                .as_ref()
                .map(|s| format!("  service: {s}"))
                .unwrap_or_default()
        );

        if args.detailed {
            if let Some(setup) = &suite.setup {
                println!("      setup  GET {setup}");
            }
            for check in &suite.checks {
                println!(
                    "      {:20} {:6} {} -> {}{}",
                    check.name,
                    check.method,
                    check.url,
                    check.expected_status,
                    if check.soft_failure { " (soft)" } else { "" }
                );
            }
            println!("──────────────────────────────────────────────────────────────────────");
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    if !config.hooks.is_empty() {
        println!("Webhooks:\n");
        for hook in &config.hooks {
            println!("  - {:20} {}", hook.name, hook.url);
        }
        println!();
    }
}

async fn show_results(args: cli::ResultsArgs, config: &AppConfig) -> Result<()> {
    let format = parse_format(&args.format)?;
    if config.storage.backend == StorageBackend::Memory {
        warn!("Memory storage keeps no runs between processes; set storage.backend to json");
    }
    let storage = open_storage(config);

    if let Some(id) = args.id {
        let run = storage
            .load_suite_run(&args.suite, id)
            .await
            .with_context(|| format!("Failed to load run {}#{}", args.suite, id))?;
        println!("{}", ResultFormatter::new(format).format_run(&run));

        if let Some(path) = args.export {
            let path = Path::new(&path);
            let export = ExportFormat::from_extension(path).unwrap_or(ExportFormat::Json);
            export_run(&run, path, export)?;
            println!("Exported to {}", path.display());
        }
    } else {
        if args.export.is_some() {
            bail!("--export needs --id");
        }
        let mut runs = storage
            .load_suite_runs_by_name(&args.suite)
            .await
            .with_context(|| format!("Failed to load runs of {}", args.suite))?;
        runs.truncate(args.limit);

        if runs.is_empty() {
            println!("No runs stored for suite '{}'", args.suite);
        } else {
            println!("{}", ResultFormatter::new(format).format_runs(&runs));
        }
    }

    storage.close().await?;
    Ok(())
}

fn manage_config(args: cli::ConfigArgs, config: &AppConfig, env: &EnvConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Show => {
            match AppConfig::find() {
                Some(path) => println!("# Loaded from {}", path.display()),
                None => println!("# No configuration file found; showing defaults"),
            }
            print!("{}", serde_yaml::to_string(config).context("Failed to render config")?);
        }
        cli::ConfigAction::Init { path, force } => {
            if Path::new(&path).exists() && !force {
                bail!("{path} already exists; use --force to overwrite");
            }
            AppConfig::example().save(&path)?;
            println!("Wrote example configuration to {path}");
        }
        cli::ConfigAction::Env => {
            print_env_help();
            println!();
            env.print_summary();
        }
    }
    Ok(())
}
