//! Orchestration engine
//!
//! [`Engine`] owns the registered suites, the hooks, the storage handle and
//! the event dispatcher. Triggers seed a run and hand it to the dispatcher,
//! which starts a suite executor for it. Queries read the dispatcher's cache
//! first and fall back to storage.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, DispatcherHandle, Event};
use crate::error::EngineError;
use crate::hooks::{Hook, HookManager, HookRegistration, RegisteredHook};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::models::{RunKey, RunParams, TestSuite, TestSuiteRun};
use crate::storage::{MemoryStorage, Storage, StorageError};
use crate::utils::InFlight;


/// Interval between polls in [`Engine::wait_for`]
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// State shared by the engine, the dispatcher loop and every executor
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub suites: HashMap<String, Arc<TestSuite>>,
    pub hooks: HookManager,
    pub storage: Arc<dyn Storage>,
    pub metrics: Arc<Metrics>,
    /// Read cache, written only by the dispatcher loop
    pub cache: DashMap<RunKey, Arc<TestSuiteRun>>,
    /// Finished runs whose final write has not succeeded yet
    pub unflushed: DashSet<RunKey>,
    /// Suite executors and triggers in progress
    pub suite_runs: InFlight,
    pub aborts: DashMap<RunKey, AbortHandle>,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn Storage>>,
    suites: Vec<TestSuite>,
    hooks: Vec<RegisteredHook>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            storage: None,
            suites: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Storage collaborator; defaults to [`MemoryStorage`]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn suite(mut self, suite: TestSuite) -> Self {
        self.suites.push(suite);
        self
    }

    pub fn suites(mut self, suites: impl IntoIterator<Item = TestSuite>) -> Self {
        self.suites.extend(suites);
        self
    }

    pub fn hook<H: Hook + 'static>(mut self, registration: HookRegistration<H>) -> Self {
        self.hooks.push(registration.into());
        self
    }

    /// Initialize hooks, seed run ids from storage and start the dispatcher
    pub async fn build(self) -> Result<Engine, EngineError> {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let mut suites = HashMap::new();
        for suite in self.suites {
            if suites.contains_key(&suite.name) {
                return Err(EngineError::DuplicateSuite(suite.name));
            }
            suites.insert(suite.name.clone(), Arc::new(suite));
        }

        let hooks = HookManager::new(self.hooks)?;

        let mut ids = HashMap::new();
        for name in suites.keys() {
            let last = storage.max_run_id(name).await?;
            debug!("Suite {} continues after run id {}", name, last);
            ids.insert(name.clone(), AtomicU64::new(last));
        }

        let shared = Arc::new(EngineShared {
            config: self.config,
            suites,
            hooks,
            storage,
            metrics: Arc::new(Metrics::new()),
            cache: DashMap::new(),
            unflushed: DashSet::new(),
            suite_runs: InFlight::new(),
            aborts: DashMap::new(),
        });
        let (dispatcher, task) = Dispatcher::spawn(shared.clone());

        info!(
            "Engine ready with {} suites and {} hooks",
            shared.suites.len(),
            shared.hooks.names().len()
        );

        Ok(Engine {
            shared,
            dispatcher,
            dispatcher_task: Mutex::new(Some(task)),
            ids,
            accepting: AtomicBool::new(true),
        })
    }
}

/// Run orchestration engine
pub struct Engine {
    shared: Arc<EngineShared>,
    dispatcher: DispatcherHandle,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    ids: HashMap<String, AtomicU64>,
    accepting: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Seed a run of `suite`, persist it and start executing it.
    ///
    /// Tests whose name does not match the filter are never instantiated.
    pub async fn trigger(&self, suite: &str, params: RunParams) -> Result<RunKey, EngineError> {
        // Counted as in flight so shutdown cannot slip between the check and the submit.
        let _in_flight = self.shared.suite_runs.enter();
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        let definition = self
            .shared
            .suites
            .get(suite)
            .ok_or_else(|| EngineError::UnknownSuite(suite.to_string()))?;

        let filter = params
            .filter
            .as_deref()
            .map(|filter| {
                Regex::new(filter).map_err(|source| EngineError::InvalidFilter {
                    filter: filter.to_string(),
                    source,
                })
            })
            .transpose()?;

        let params = params.resolve(
            definition,
            self.shared.config.default_max_attempts,
            self.shared.config.default_timeout_secs,
        );
        let id = self.next_id(suite)?;
        let run = TestSuiteRun::seed(definition, id, params, filter.as_ref(), Utc::now());
        let key = run.key();

        self.shared.storage.insert_suite_run(&run).await?;
        info!(
            suite = %key.suite,
            run_id = key.id,
            "Triggered {} ({}, {} tests)",
            key,
            run.params.trigger,
            run.tests.len()
        );

        self.dispatcher.submit(Event::RunStarted { run }).await?;
        Ok(key)
    }

    fn next_id(&self, suite: &str) -> Result<u64, EngineError> {
        let counter = self
            .ids
            .get(suite)
            .ok_or_else(|| EngineError::UnknownSuite(suite.to_string()))?;
        Ok(counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Most recent known state of a run, including `Pending`
    pub async fn run(&self, suite: &str, id: u64) -> Result<TestSuiteRun, EngineError> {
        let key = RunKey::new(suite, id);
        if let Some(run) = self.shared.cache.get(&key) {
            return Ok(TestSuiteRun::clone(run.value()));
        }

        match self.shared.storage.load_suite_run(suite, id).await {
            Ok(run) => Ok(run),
            Err(StorageError::NotFound(_)) => Err(EngineError::RunNotFound(key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Every known run of a suite ordered by id; cached state wins over storage
    pub async fn runs(&self, suite: &str) -> Result<Vec<TestSuiteRun>, EngineError> {
        let mut runs: BTreeMap<u64, TestSuiteRun> = self
            .shared
            .storage
            .load_suite_runs_by_name(suite)
            .await?
            .into_iter()
            .map(|run| (run.id, run))
            .collect();

        for entry in self.shared.cache.iter() {
            if entry.key().suite == suite {
                runs.insert(entry.key().id, TestSuiteRun::clone(entry.value()));
            }
        }

        Ok(runs.into_values().collect())
    }

    /// Poll until the run is terminal or `timeout` elapses
    pub async fn wait_for(&self, key: &RunKey, timeout: Duration) -> Result<TestSuiteRun, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.run(&key.suite, key.id).await?;
            if run.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(key.clone()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Resume runs that storage holds as not yet terminal.
    ///
    /// Returns how many runs were resumed.
    pub async fn recover_pending(&self) -> Result<usize, EngineError> {
        let _in_flight = self.shared.suite_runs.enter();
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        let mut resumed = 0;
        for run in self.shared.storage.load_pending_suite_runs().await? {
            let key = run.key();
            if !self.shared.suites.contains_key(&run.suite) {
                warn!("Not resuming {}: suite is not registered", key);
                continue;
            }
            if self.shared.cache.contains_key(&key) {
                continue;
            }

            info!(suite = %key.suite, run_id = key.id, "Resuming {}", key);
            self.dispatcher.submit(Event::RunStarted { run }).await?;
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Retry the final write of runs whose persistence failed.
    ///
    /// Returns how many runs were written. Stops at the first failure.
    pub async fn flush(&self) -> Result<usize, EngineError> {
        let keys: Vec<RunKey> = self.shared.unflushed.iter().map(|k| k.key().clone()).collect();

        let mut flushed = 0;
        for key in keys {
            let Some(run) = self.shared.cache.get(&key).map(|r| r.value().clone()) else {
                self.shared.unflushed.remove(&key);
                continue;
            };
            // Still running its completion path; the executor writes it.
            if !run.is_terminal() {
                continue;
            }

            self.shared.storage.update_suite_run(&run).await?;
            self.shared.unflushed.remove(&key);
            debug!("Flushed {}", key);
            flushed += 1;
        }

        Ok(flushed)
    }

    /// Runs whose final write is outstanding
    pub fn unflushed(&self) -> usize {
        self.shared.unflushed.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Registered suite names, sorted
    pub fn suites(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.shared.suites.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn suite(&self, name: &str) -> Option<Arc<TestSuite>> {
        self.shared.suites.get(name).cloned()
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.shared.hooks.names()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting triggers, let running suites finish within the grace
    /// period, drain asynchronous hooks, then stop the dispatcher and close
    /// storage. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            debug!("Engine already shut down");
            return Ok(());
        }

        let grace = self.shared.config.shutdown_grace();
        info!(
            "Shutting down: waiting up to {:?} for {} active suite runs",
            grace,
            self.shared.suite_runs.count()
        );

        if tokio::time::timeout(grace, self.shared.suite_runs.wait())
            .await
            .is_err()
        {
            warn!(
                "Aborting {} suite runs still active after {:?}",
                self.shared.aborts.len(),
                grace
            );
            for entry in self.shared.aborts.iter() {
                entry.value().abort();
            }
            self.shared.suite_runs.wait().await;
        }

        self.shared.hooks.drain().await;

        self.dispatcher.stop().await;
        let task = self.dispatcher_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Dispatcher task ended abnormally: {}", e);
            }
        }

        let unflushed = self.shared.unflushed.len();
        if unflushed > 0 {
            warn!("{} finished runs were never persisted", unflushed);
        }

        self.shared.storage.close().await?;
        info!("Engine stopped");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher_task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("suites", &self.suites())
            .field("hooks", &self.hook_names())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}
