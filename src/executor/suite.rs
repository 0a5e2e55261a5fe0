//! Suite run driver

use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{execute_test, guarded, panic_message, policy, Guarded};
use crate::dispatcher::{DispatcherHandle, Event};
use crate::engine::EngineShared;
use crate::error::EngineError;
use crate::hooks::CallbackSink;
use crate::models::{HookFn, RunKey, RunResult, TestRun, TestSuite, TestSuiteRun};
use crate::utils::Timer;

/// Drives one suite run from setup to hook notification.
///
/// The executor never writes the run itself. It submits events and works
/// from the snapshots the dispatcher hands back.
pub(crate) struct SuiteExecutor {
    shared: Arc<EngineShared>,
    dispatcher: DispatcherHandle,
    suite: Arc<TestSuite>,
    key: RunKey,
}

impl SuiteExecutor {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        dispatcher: DispatcherHandle,
        suite: Arc<TestSuite>,
        key: RunKey,
    ) -> Self {
        Self {
            shared,
            dispatcher,
            suite,
            key,
        }
    }

    pub(crate) async fn run(self) {
        if let Err(e) = self.drive().await {
            error!(suite = %self.key.suite, run_id = self.key.id, "Suite run {} stopped: {}", self.key, e);
        }
    }

    async fn drive(&self) -> Result<(), EngineError> {
        let timer = Timer::start(format!("suite run {}", self.key));
        let mut run = self
            .submit(Event::RunRunning {
                key: self.key.clone(),
                started_at: Utc::now(),
            })
            .await?;

        let deadline = run.timeout().map(|limit| Instant::now() + limit);
        info!(
            suite = %self.key.suite,
            run_id = self.key.id,
            "Running suite {} ({} tests, max {} attempts)",
            self.key,
            run.latest_attempts().len(),
            run.max_attempts()
        );

        match self.setup(deadline).await {
            Ok(()) => self.run_tests(&mut run, deadline).await?,
            Err(message) => {
                warn!("Suite run {}: {}", self.key, message);
                self.submit(Event::SetupFailed {
                    key: self.key.clone(),
                    logs: message,
                })
                .await?;
            }
        }

        self.teardown().await;

        let run = self
            .submit(Event::RunFinished {
                key: self.key.clone(),
                ended_at: Utc::now(),
            })
            .await?;
        self.persist(&run).await;

        self.shared
            .metrics
            .record_suite(self.suite.service_label(), &self.suite.name, run.result);

        let summary = run.summary();
        info!(
            suite = %self.key.suite,
            run_id = self.key.id,
            "Suite run {} finished: {} ({}/{} passed{}) in {}ms",
            self.key,
            run.result,
            summary.passed,
            summary.total,
            if run.flaky { ", flaky" } else { "" },
            timer.stop()
        );

        self.shared
            .hooks
            .suite_finished(&self.suite, &run, &self.sink())
            .await;
        Ok(())
    }

    /// Execute every pending attempt in declaration order, retrying in place
    async fn run_tests(
        &self,
        run: &mut Arc<TestSuiteRun>,
        deadline: Option<Instant>,
    ) -> Result<(), EngineError> {
        let queue: Vec<TestRun> = run.latest_attempts().into_iter().cloned().collect();

        for latest in queue {
            let mut attempt = if latest.result == RunResult::Pending {
                latest
            } else if policy::should_retry(run, &latest) {
                // Recovered run that stopped between an attempt and its retry
                self.schedule_retry(run, &latest).await?
            } else {
                continue;
            };

            loop {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return self.time_out(run).await;
                }

                let executed = execute_test(&self.suite, &attempt, deadline, &self.shared.metrics).await;
                let record = executed.record;

                *run = self.submit(Event::TestRecorded { test: record.clone() }).await?;
                if let Err(e) = self.shared.storage.update_test_run(&record).await {
                    warn!("Failed to persist {} attempt {} of {}: {}", record.name, record.attempt, self.key, e);
                }

                self.shared
                    .hooks
                    .test_finished(&self.suite, run, &record, &self.sink())
                    .await;

                if executed.timed_out {
                    return self.time_out(run).await;
                }
                if !policy::should_retry(run, &record) {
                    break;
                }

                info!(
                    "Retrying {} in {} (attempt {}/{})",
                    record.name,
                    self.key,
                    record.attempt + 1,
                    run.max_attempts()
                );
                attempt = self.schedule_retry(run, &record).await?;
            }
        }

        Ok(())
    }

    async fn schedule_retry(
        &self,
        run: &mut Arc<TestSuiteRun>,
        failed: &TestRun,
    ) -> Result<TestRun, EngineError> {
        let next = failed.next_attempt();
        *run = self.submit(Event::TestRecorded { test: next.clone() }).await?;
        if let Err(e) = self.shared.storage.insert_test_run(&next).await {
            warn!("Failed to persist retry of {} in {}: {}", next.name, self.key, e);
        }
        Ok(next)
    }

    async fn time_out(&self, run: &mut Arc<TestSuiteRun>) -> Result<(), EngineError> {
        let limit = run.params.timeout_secs.unwrap_or_default();
        warn!("Suite run {} exceeded its {}s deadline", self.key, limit);
        *run = self
            .submit(Event::RunTimedOut {
                key: self.key.clone(),
                message: format!("suite deadline of {limit}s exceeded"),
            })
            .await?;
        Ok(())
    }

    async fn setup(&self, deadline: Option<Instant>) -> Result<(), String> {
        let Some(setup) = self.suite.setup.clone() else {
            return Ok(());
        };

        match call(setup, deadline).await {
            Guarded::Completed(Ok(())) => Ok(()),
            Guarded::Completed(Err(e)) => Err(format!("setup failed: {e:#}")),
            Guarded::Panicked(payload) => Err(format!(
                "setup failed: panic: {}",
                panic_message(payload.as_ref())
            )),
            Guarded::TimedOut => Err("setup failed: suite deadline exceeded".to_string()),
        }
    }

    /// Teardown always runs to completion and never changes the result
    async fn teardown(&self) {
        let Some(teardown) = self.suite.teardown.clone() else {
            return;
        };

        match call(teardown, None).await {
            Guarded::Completed(Ok(())) => {}
            Guarded::Completed(Err(e)) => warn!("Teardown of {} failed: {:#}", self.key, e),
            Guarded::Panicked(payload) => warn!(
                "Teardown of {} panicked: {}",
                self.key,
                panic_message(payload.as_ref())
            ),
            Guarded::TimedOut => {}
        }
    }

    /// Final write; on failure the run stays in the cache until flushed.
    ///
    /// Hook context merged while the write was in flight would be
    /// overwritten by the older snapshot, so the latest cached state is
    /// written again until nothing changed underneath.
    async fn persist(&self, run: &Arc<TestSuiteRun>) {
        let mut written = run.clone();
        loop {
            if let Err(e) = self.shared.storage.update_suite_run(&written).await {
                error!(
                    suite = %self.key.suite,
                    run_id = self.key.id,
                    "Failed to persist suite run {}: {}",
                    self.key,
                    e
                );
                return;
            }

            match self.shared.cache.get(&self.key).map(|r| r.value().clone()) {
                Some(latest) if !Arc::ptr_eq(&latest, &written) => {
                    debug!("Suite run {} changed while persisting, writing again", self.key);
                    written = latest;
                }
                _ => break,
            }
        }
        self.shared.unflushed.remove(&self.key);
    }

    fn sink(&self) -> CallbackSink {
        CallbackSink::new(self.dispatcher.clone(), self.shared.storage.clone())
    }

    async fn submit(&self, event: Event) -> Result<Arc<TestSuiteRun>, EngineError> {
        self.dispatcher.submit(event).await
    }
}

async fn call(hook: HookFn, deadline: Option<Instant>) -> Guarded<anyhow::Result<()>> {
    guarded(async move { hook().await }, deadline).await
}
