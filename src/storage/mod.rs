//! Durable persistence of suite runs
//!
//! The engine talks to storage only through [`Storage`]. Writes go through a
//! [`Transaction`]: operations are staged, applied together on `commit`,
//! and discarded on `rollback` or when the transaction is dropped.

mod json;
mod memory;

pub use json::{export_run, ExportFormat, JsonStorage};
pub use memory::MemoryStorage;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::models::{RunKey, TestRun, TestSuiteRun};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage is closed")]
    Closed,
}

/// A scoped unit of writes
#[async_trait]
pub trait Transaction: Send {
    fn insert_suite_run(&mut self, run: &TestSuiteRun);
    fn update_suite_run(&mut self, run: &TestSuiteRun);
    fn insert_test_run(&mut self, test: &TestRun);
    fn update_test_run(&mut self, test: &TestRun);

    /// Apply every staged write, or none of them
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard staged writes
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Persistence collaborator of the engine
#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;

    async fn load_suite_run(&self, suite: &str, id: u64) -> Result<TestSuiteRun, StorageError>;

    /// All runs of a suite, newest first
    async fn load_suite_runs_by_name(&self, suite: &str) -> Result<Vec<TestSuiteRun>, StorageError>;

    /// Runs that never reached a terminal result
    async fn load_pending_suite_runs(&self) -> Result<Vec<TestSuiteRun>, StorageError>;

    /// Highest run id stored for a suite, 0 if none
    async fn max_run_id(&self, suite: &str) -> Result<u64, StorageError>;

    async fn close(&self) -> Result<(), StorageError>;

    async fn insert_suite_run(&self, run: &TestSuiteRun) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        tx.insert_suite_run(run);
        tx.commit().await
    }

    async fn update_suite_run(&self, run: &TestSuiteRun) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        tx.update_suite_run(run);
        tx.commit().await
    }

    async fn insert_test_run(&self, test: &TestRun) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        tx.insert_test_run(test);
        tx.commit().await
    }

    async fn update_test_run(&self, test: &TestRun) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        tx.update_test_run(test);
        tx.commit().await
    }
}

/// A staged write
#[derive(Clone, Debug)]
pub(crate) enum WriteOp {
    InsertSuiteRun(TestSuiteRun),
    UpdateSuiteRun(TestSuiteRun),
    InsertTestRun(TestRun),
    UpdateTestRun(TestRun),
}

impl WriteOp {
    fn key(&self) -> RunKey {
        match self {
            WriteOp::InsertSuiteRun(run) | WriteOp::UpdateSuiteRun(run) => run.key(),
            WriteOp::InsertTestRun(test) | WriteOp::UpdateTestRun(test) => test.key(),
        }
    }
}

/// Replay staged writes over the current records.
///
/// `load` returns the stored run for a key. The result holds every touched
/// run in its post-commit state; nothing is written if any op fails.
pub(crate) fn replay<F>(
    ops: &[WriteOp],
    mut load: F,
) -> Result<BTreeMap<RunKey, TestSuiteRun>, StorageError>
where
    F: FnMut(&RunKey) -> Option<TestSuiteRun>,
{
    let mut touched: BTreeMap<RunKey, Option<TestSuiteRun>> = BTreeMap::new();

    for op in ops {
        let key = op.key();
        let slot = touched.entry(key.clone()).or_insert_with(|| load(&key));

        match op {
            WriteOp::InsertSuiteRun(run) => {
                if slot.is_some() {
                    return Err(StorageError::Conflict(format!("suite run {key}")));
                }
                *slot = Some(run.clone());
            }
            WriteOp::UpdateSuiteRun(run) => {
                if slot.is_none() {
                    return Err(StorageError::NotFound(format!("suite run {key}")));
                }
                *slot = Some(run.clone());
            }
            WriteOp::InsertTestRun(test) => {
                let run = slot
                    .as_mut()
                    .ok_or_else(|| StorageError::NotFound(format!("suite run {key}")))?;
                if run.attempt(&test.name, test.attempt).is_some() {
                    return Err(StorageError::Conflict(format!(
                        "test run {key}/{} attempt {}",
                        test.name, test.attempt
                    )));
                }
                run.tests.push(test.clone());
            }
            WriteOp::UpdateTestRun(test) => {
                let run = slot
                    .as_mut()
                    .ok_or_else(|| StorageError::NotFound(format!("suite run {key}")))?;
                let existing = run.attempt_mut(&test.name, test.attempt).ok_or_else(|| {
                    StorageError::NotFound(format!(
                        "test run {key}/{} attempt {}",
                        test.name, test.attempt
                    ))
                })?;
                *existing = test.clone();
            }
        }
    }

    Ok(touched
        .into_iter()
        .filter_map(|(key, run)| run.map(|run| (key, run)))
        .collect())
}

/// Backend side of a [`StagedTransaction`]
#[async_trait]
pub(crate) trait ApplyWrites: Send + Sync + 'static {
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StorageError>;
}

/// Transaction that buffers writes until commit
pub(crate) struct StagedTransaction<B: ApplyWrites> {
    backend: Arc<B>,
    ops: Vec<WriteOp>,
}

impl<B: ApplyWrites> StagedTransaction<B> {
    pub(crate) fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            ops: Vec::new(),
        }
    }
}

#[async_trait]
impl<B: ApplyWrites> Transaction for StagedTransaction<B> {
    fn insert_suite_run(&mut self, run: &TestSuiteRun) {
        self.ops.push(WriteOp::InsertSuiteRun(run.clone()));
    }

    fn update_suite_run(&mut self, run: &TestSuiteRun) {
        self.ops.push(WriteOp::UpdateSuiteRun(run.clone()));
    }

    fn insert_test_run(&mut self, test: &TestRun) {
        self.ops.push(WriteOp::InsertTestRun(test.clone()));
    }

    fn update_test_run(&mut self, test: &TestRun) {
        self.ops.push(WriteOp::UpdateTestRun(test.clone()));
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut tx = self;
        let ops = std::mem::take(&mut tx.ops);
        if ops.is_empty() {
            return Ok(());
        }
        tx.backend.apply(ops).await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        let mut tx = self;
        tx.ops.clear();
        Ok(())
    }
}

impl<B: ApplyWrites> Drop for StagedTransaction<B> {
    fn drop(&mut self) {
        if !self.ops.is_empty() {
            debug!("Rolling back {} uncommitted writes", self.ops.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunParams, RunResult, TestSuite};
    use chrono::Utc;

    fn seeded(id: u64) -> TestSuiteRun {
        let suite = TestSuite::builder("api")
            .test("health", |_t| async {})
            .build()
            .unwrap();
        TestSuiteRun::seed(&suite, id, RunParams::manual(), None, Utc::now())
    }

    #[test]
    fn test_replay_insert_then_update_test() {
        let run = seeded(1);
        let mut done = run.tests[0].clone();
        done.result = RunResult::Failed;
        let retry = done.next_attempt();

        let ops = vec![
            WriteOp::InsertSuiteRun(run.clone()),
            WriteOp::UpdateTestRun(done),
            WriteOp::InsertTestRun(retry),
        ];
        let touched = replay(&ops, |_| None).unwrap();
        let stored = &touched[&run.key()];
        assert_eq!(stored.tests.len(), 2);
        assert_eq!(stored.tests[0].result, RunResult::Failed);
        assert_eq!(stored.tests[1].attempt, 2);
    }

    #[test]
    fn test_replay_rejects_duplicate_insert() {
        let run = seeded(1);
        let existing = run.clone();
        let err = replay(&[WriteOp::InsertSuiteRun(run)], |_| Some(existing.clone())).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn test_replay_update_missing_run() {
        let run = seeded(3);
        let err = replay(&[WriteOp::UpdateSuiteRun(run)], |_| None).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
