//! Process-local storage backend

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{replay, ApplyWrites, StagedTransaction, Storage, StorageError, Transaction, WriteOp};
use crate::models::{RunKey, TestSuiteRun};

#[derive(Debug, Default)]
struct MemoryInner {
    runs: RwLock<BTreeMap<RunKey, TestSuiteRun>>,
    closed: AtomicBool,
}

#[async_trait]
impl ApplyWrites for MemoryInner {
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let mut runs = self.runs.write();
        let touched = replay(&ops, |key| runs.get(key).cloned())?;
        runs.extend(touched);
        Ok(())
    }
}

/// Keeps runs in memory; contents are lost with the process
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        self.ensure_open()?;
        Ok(Box::new(StagedTransaction::new(self.inner.clone())))
    }

    async fn load_suite_run(&self, suite: &str, id: u64) -> Result<TestSuiteRun, StorageError> {
        self.ensure_open()?;
        let key = RunKey::new(suite, id);
        self.inner
            .runs
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("suite run {key}")))
    }

    async fn load_suite_runs_by_name(&self, suite: &str) -> Result<Vec<TestSuiteRun>, StorageError> {
        self.ensure_open()?;
        let runs = self.inner.runs.read();
        Ok(runs
            .values()
            .rev()
            .filter(|run| run.suite == suite)
            .cloned()
            .collect())
    }

    async fn load_pending_suite_runs(&self) -> Result<Vec<TestSuiteRun>, StorageError> {
        self.ensure_open()?;
        let runs = self.inner.runs.read();
        Ok(runs
            .values()
            .filter(|run| !run.is_terminal())
            .cloned()
            .collect())
    }

    async fn max_run_id(&self, suite: &str) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let runs = self.inner.runs.read();
        Ok(runs
            .keys()
            .filter(|key| key.suite == suite)
            .map(|key| key.id)
            .max()
            .unwrap_or(0))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
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
            .test("login", |_t| async {})
            .build()
            .unwrap();
        TestSuiteRun::seed(&suite, id, RunParams::manual(), None, Utc::now())
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let storage = MemoryStorage::new();
        storage.insert_suite_run(&seeded(1)).await.unwrap();
        storage.insert_suite_run(&seeded(2)).await.unwrap();

        let loaded = storage.load_suite_run("api", 2).await.unwrap();
        assert_eq!(loaded.id, 2);
        assert_eq!(storage.max_run_id("api").await.unwrap(), 2);
        assert_eq!(storage.max_run_id("other").await.unwrap(), 0);

        let all = storage.load_suite_runs_by_name("api").await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let storage = MemoryStorage::new();
        {
            let mut tx = storage.begin().await.unwrap();
            tx.insert_suite_run(&seeded(1));
        }
        assert!(storage.is_empty());

        let mut tx = storage.begin().await.unwrap();
        tx.insert_suite_run(&seeded(1));
        tx.rollback().await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let storage = MemoryStorage::new();
        let run = seeded(1);
        storage.insert_suite_run(&run).await.unwrap();

        let mut done = run.tests[0].clone();
        done.result = RunResult::Passed;

        let mut tx = storage.begin().await.unwrap();
        tx.update_test_run(&done);
        // Conflicts with the stored run, so the whole commit must fail.
        tx.insert_suite_run(&run);
        assert!(matches!(tx.commit().await, Err(StorageError::Conflict(_))));

        let stored = storage.load_suite_run("api", 1).await.unwrap();
        assert_eq!(stored.tests[0].result, RunResult::Pending);
    }

    #[tokio::test]
    async fn test_pending_runs_and_close() {
        let storage = MemoryStorage::new();
        let mut finished = seeded(1);
        finished.result = RunResult::Passed;
        storage.insert_suite_run(&finished).await.unwrap();
        storage.insert_suite_run(&seeded(2)).await.unwrap();

        let pending = storage.load_pending_suite_runs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 2);

        storage.close().await.unwrap();
        assert!(matches!(storage.begin().await, Err(StorageError::Closed)));
    }
}
