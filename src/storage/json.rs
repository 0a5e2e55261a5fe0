//! File-backed storage
//!
//! Each run is one pretty-printed JSON document at `<dir>/<suite>/<id>.json`.
//! Writes go to a temporary file first and are renamed into place.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{replay, ApplyWrites, StagedTransaction, Storage, StorageError, Transaction, WriteOp};
use crate::models::{RunKey, TestSuiteRun};

#[derive(Debug)]
struct JsonInner {
    base_dir: PathBuf,
    closed: AtomicBool,
    // Serializes commits so replay always sees the latest files.
    write_lock: Mutex<()>,
}

impl JsonInner {
    fn suite_dir(&self, suite: &str) -> PathBuf {
        self.base_dir.join(file_safe(suite))
    }

    fn run_path(&self, key: &RunKey) -> PathBuf {
        self.suite_dir(&key.suite).join(format!("{}.json", key.id))
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    async fn read_run(&self, path: &Path) -> Result<Option<TestSuiteRun>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_run(&self, run: &TestSuiteRun) -> Result<(), StorageError> {
        let path = self.run_path(&run.key());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(run)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Wrote suite run {} to {}", run.key(), path.display());
        Ok(())
    }

    /// Every run file of one suite directory
    async fn scan_suite_dir(&self, dir: &Path) -> Result<Vec<TestSuiteRun>, StorageError> {
        let mut runs = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match self.read_run(&path).await {
                    Ok(Some(run)) => runs.push(run),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping unreadable run file {}: {}", path.display(), e),
                }
            }
        }

        Ok(runs)
    }
}

#[async_trait]
impl ApplyWrites for JsonInner {
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;

        let mut current: BTreeMap<RunKey, TestSuiteRun> = BTreeMap::new();
        for op in &ops {
            let key = op.key();
            if current.contains_key(&key) {
                continue;
            }
            if let Some(run) = self.read_run(&self.run_path(&key)).await? {
                current.insert(key, run);
            }
        }

        let touched = replay(&ops, |key| current.get(key).cloned())?;
        for run in touched.values() {
            self.write_run(run).await?;
        }
        Ok(())
    }
}

/// Stores runs as JSON documents below a base directory
#[derive(Clone, Debug)]
pub struct JsonStorage {
    inner: Arc<JsonInner>,
}

impl JsonStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(JsonInner {
                base_dir: base_dir.into(),
                closed: AtomicBool::new(false),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Platform data directory, e.g. `~/.local/share/suite-runner/runs`
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("suite-runner")
            .join("runs")
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    /// Suite directories that hold at least one run
    pub async fn list_suites(&self) -> Result<Vec<String>, StorageError> {
        let mut suites = Vec::new();
        let mut entries = match fs::read_dir(&self.inner.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(suites),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    suites.push(name.to_string());
                }
            }
        }

        suites.sort();
        Ok(suites)
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        self.inner.ensure_open()?;
        Ok(Box::new(StagedTransaction::new(self.inner.clone())))
    }

    async fn load_suite_run(&self, suite: &str, id: u64) -> Result<TestSuiteRun, StorageError> {
        self.inner.ensure_open()?;
        let key = RunKey::new(suite, id);
        self.inner
            .read_run(&self.inner.run_path(&key))
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("suite run {key}")))
    }

    async fn load_suite_runs_by_name(&self, suite: &str) -> Result<Vec<TestSuiteRun>, StorageError> {
        self.inner.ensure_open()?;
        let mut runs = self.inner.scan_suite_dir(&self.inner.suite_dir(suite)).await?;
        runs.retain(|run| run.suite == suite);
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(runs)
    }

    async fn load_pending_suite_runs(&self) -> Result<Vec<TestSuiteRun>, StorageError> {
        self.inner.ensure_open()?;
        let mut pending = Vec::new();
        for suite in self.list_suites().await? {
            let runs = self
                .inner
                .scan_suite_dir(&self.inner.base_dir.join(&suite))
                .await?;
            pending.extend(runs.into_iter().filter(|run| !run.is_terminal()));
        }
        pending.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(pending)
    }

    async fn max_run_id(&self, suite: &str) -> Result<u64, StorageError> {
        self.inner.ensure_open()?;
        let mut max = 0;
        let mut entries = match fs::read_dir(self.inner.suite_dir(suite)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                max = max.max(id);
            }
        }
        Ok(max)
    }

    async fn close(&self) -> Result<(), StorageError> {
        // Wait for an in-progress commit before refusing new ones.
        let _guard = self.inner.write_lock.lock().await;
        self.inner.closed.store(true, Ordering::Release);
        info!("Closed run storage at {}", self.inner.base_dir.display());
        Ok(())
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

/// Export format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::parse)
    }
}

/// Write a run to a file, one row per attempt for CSV
pub fn export_run(run: &TestSuiteRun, path: &Path, format: ExportFormat) -> anyhow::Result<()> {
    match format {
        ExportFormat::Json => {
            let file = File::create(path).context("Failed to create export file")?;
            serde_json::to_writer_pretty(BufWriter::new(file), run)
                .context("Failed to write run")?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(path)?;
            writer.write_record([
                "suite",
                "run_id",
                "test",
                "attempt",
                "result",
                "soft_failure",
                "duration_ms",
                "logs",
            ])?;

            for test in &run.tests {
                writer.write_record([
                    test.suite.clone(),
                    test.run_id.to_string(),
                    test.name.clone(),
                    test.attempt.to_string(),
                    test.result.as_str().to_string(),
                    test.soft_failure.to_string(),
                    test.duration_ms.to_string(),
                    test.logs.trim_end().to_string(),
                ])?;
            }
            writer.flush()?;
        }
    }

    info!("Exported suite run {} to {}", run.key(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunParams, RunResult, TestSuite};
    use chrono::Utc;
    use tempfile::TempDir;

    fn seeded(suite: &str, id: u64) -> TestSuiteRun {
        let suite = TestSuite::builder(suite)
            .test("health", |_t| async {})
            .build()
            .unwrap();
        TestSuiteRun::seed(&suite, id, RunParams::manual(), None, Utc::now())
    }

    #[tokio::test]
    async fn test_round_trip_through_files() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path());

        let mut run = seeded("api", 3);
        storage.insert_suite_run(&run).await.unwrap();
        assert!(dir.path().join("api").join("3.json").exists());

        run.tests[0].result = RunResult::Passed;
        run.tests[0].log_line("ok");
        storage.update_test_run(&run.tests[0]).await.unwrap();

        let loaded = storage.load_suite_run("api", 3).await.unwrap();
        assert_eq!(loaded.tests[0].result, RunResult::Passed);
        assert_eq!(loaded.tests[0].logs, "ok\n");
        assert_eq!(storage.max_run_id("api").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_runs_newest_first_and_pending_scan() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path());

        let mut done = seeded("api", 1);
        done.result = RunResult::Failed;
        storage.insert_suite_run(&done).await.unwrap();
        storage.insert_suite_run(&seeded("api", 2)).await.unwrap();
        storage.insert_suite_run(&seeded("web", 1)).await.unwrap();

        let runs = storage.load_suite_runs_by_name("api").await.unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);

        let pending = storage.load_pending_suite_runs().await.unwrap();
        let keys: Vec<_> = pending.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, vec!["api#2", "web#1"]);
        assert_eq!(storage.list_suites().await.unwrap(), vec!["api", "web"]);
    }

    #[tokio::test]
    async fn test_missing_run_and_closed_storage() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path());

        let err = storage.load_suite_run("api", 9).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert_eq!(storage.max_run_id("api").await.unwrap(), 0);

        storage.close().await.unwrap();
        let err = storage.insert_suite_run(&seeded("api", 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }

    #[test]
    fn test_export_csv_has_one_row_per_attempt() {
        let dir = TempDir::new().unwrap();
        let mut run = seeded("api", 1);
        run.tests[0].result = RunResult::Failed;
        let retry = run.tests[0].next_attempt();
        run.tests.push(retry);

        let path = dir.path().join("run.csv");
        export_run(&run, &path, ExportFormat::Csv).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains("api,1,health,2,pending"));
    }

    #[test]
    fn test_export_format() {
        assert_eq!(ExportFormat::parse("JSON"), Some(ExportFormat::Json));
        assert_eq!(
            ExportFormat::from_extension(Path::new("out.csv")),
            Some(ExportFormat::Csv)
        );
        assert!(ExportFormat::parse("xml").is_none());
    }
}
