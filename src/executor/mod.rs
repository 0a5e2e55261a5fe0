//! Suite and test execution
//!
//! The suite executor drives one run from setup to hook notification. The
//! test executor runs a single attempt and classifies how it ended. Neither
//! mutates a run directly: every change is submitted to the dispatcher.

pub mod policy;
mod suite;

pub(crate) use suite::SuiteExecutor;
pub(crate) use test::{execute_test, ExecutedAttempt};

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::time::Instant;

/// How a guarded callback ended
#[derive(Debug)]
pub(crate) enum Guarded<T> {
    Completed(T),
    Panicked(Box<dyn Any + Send>),
    TimedOut,
}

/// Run `fut`, catching panics and stopping at `deadline` if one is set
pub(crate) async fn guarded<F, T>(fut: F, deadline: Option<Instant>) -> Guarded<T>
where
    F: Future<Output = T>,
{
    let caught = AssertUnwindSafe(fut).catch_unwind();
    let outcome = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, caught).await {
            Ok(outcome) => outcome,
            Err(_) => return Guarded::TimedOut,
        },
        None => caught.await,
    };

    match outcome {
        Ok(value) => Guarded::Completed(value),
        Err(payload) => Guarded::Panicked(payload),
    }
}

/// Textual form of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
