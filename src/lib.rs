//! Suite Runner - test suite orchestration engine
//!
//! Runs named suites of async test functions with per-test retries, flaky
//! detection, suite setup and teardown, and hooks that observe every
//! finished attempt and run.
//!
//! ## Features
//!
//! - Single-writer event dispatcher owning every run's state
//! - Same-pass retries up to a configurable number of attempts
//! - Whole-suite timeouts that abandon the remaining tests
//! - Synchronous and asynchronous hooks, drained on shutdown
//! - Pluggable storage with in-memory and JSON file backends
//! - Recovery of runs left pending by a previous process
//!
//! ## Example
//!
//! ```no_run
//! use suite_runner::{EngineBuilder, EngineConfig, RunParams, TestSuite};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let suite = TestSuite::builder("smoke")
//!     .test("ping", |t| async move {
//!         if t.attempt() == 1 {
//!             t.error("cold cache");
//!         }
//!     })
//!     .max_attempts(2)
//!     .build()?;
//!
//! let engine = EngineBuilder::new(EngineConfig::default()).suite(suite).build().await?;
//! let key = engine.trigger("smoke", RunParams::manual()).await?;
//! let run = engine.wait_for(&key, Duration::from_secs(30)).await?;
//! assert!(run.flaky);
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod checks;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod http;
pub mod metrics;
pub mod models;
pub mod output;
pub mod storage;
pub mod tb;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use hooks::{
    Hook, HookCallback, HookRegistration, SuiteFinishedAsyncHook, SuiteFinishedHook,
    TestFinishedAsyncHook, TestFinishedHook,
};
pub use metrics::MetricsSnapshot;
pub use models::{RunKey, RunParams, RunResult, TestRun, TestSuite, TestSuiteRun};
pub use storage::{Storage, StorageError};
pub use tb::Tb;
