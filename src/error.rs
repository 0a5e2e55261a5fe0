//! Engine error types

use thiserror::Error;

use crate::models::RunKey;
use crate::storage::StorageError;

/// Errors surfaced by the orchestration engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown suite: {0}")]
    UnknownSuite(String),

    #[error("Suite already registered: {0}")]
    DuplicateSuite(String),

    #[error("Test '{test}' declared twice in suite '{suite}'")]
    DuplicateTest { suite: String, test: String },

    #[error("Invalid test filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: regex::Error,
    },

    /// An event addressed a run the dispatcher does not hold.
    #[error("Protocol inconsistency: {event} event for unknown run {key}")]
    UnknownRun { key: RunKey, event: &'static str },

    #[error("Suite run not found: {0}")]
    RunNotFound(RunKey),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Event dispatcher is closed")]
    DispatcherClosed,

    #[error("Hook '{0}' is registered under no listener role")]
    HookRegistration(String),

    #[error("Hook '{name}' failed to initialize: {source}")]
    HookInit {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Timed out waiting for suite run {0}")]
    Timeout(RunKey),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
