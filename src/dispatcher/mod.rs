//! Single-writer event dispatcher
//!
//! Every mutation of a suite run goes through one bounded queue and is
//! applied by one loop, so no two changes to the same run interleave. The
//! loop owns the read cache and answers each submitter with the run's new
//! state.

mod event;

pub use event::{apply, Event, MergeTarget};

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::EngineShared;
use crate::error::EngineError;
use crate::executor::SuiteExecutor;
use crate::models::TestSuiteRun;

type Reply = oneshot::Sender<Result<Arc<TestSuiteRun>, EngineError>>;

enum Command {
    Apply { event: Event, reply: Reply },
    Stop,
}

/// Submission side of the dispatcher queue
#[derive(Clone, Debug)]
pub(crate) struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Queue `event` and wait until it has been applied
    pub(crate) async fn submit(&self, event: Event) -> Result<Arc<TestSuiteRun>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply { event, reply })
            .await
            .map_err(|_| EngineError::DispatcherClosed)?;
        rx.await.map_err(|_| EngineError::DispatcherClosed)?
    }

    /// Ask the loop to exit after the events already queued
    pub(crate) async fn stop(&self) {
        if self.tx.send(Command::Stop).await.is_err() {
            debug!("Dispatcher already stopped");
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Apply { event, .. } => write!(f, "Apply({event})"),
            Command::Stop => write!(f, "Stop"),
        }
    }
}

pub(crate) struct Dispatcher {
    rx: mpsc::Receiver<Command>,
    shared: Arc<EngineShared>,
    handle: DispatcherHandle,
}

impl Dispatcher {
    /// Start the loop on its own task
    pub(crate) fn spawn(shared: Arc<EngineShared>) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(shared.config.queue_capacity.max(1));
        let handle = DispatcherHandle { tx };
        let dispatcher = Dispatcher {
            rx,
            shared,
            handle: handle.clone(),
        };
        (handle, tokio::spawn(dispatcher.run()))
    }

    async fn run(mut self) {
        info!("Event dispatcher started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Apply { event, reply } => {
                    let result = self.dispatch(event);
                    // The submitter may have given up waiting.
                    let _ = reply.send(result);
                }
                Command::Stop => break,
            }
        }

        info!("Event dispatcher stopped");
    }

    fn dispatch(&mut self, event: Event) -> Result<Arc<TestSuiteRun>, EngineError> {
        let key = event.key();
        let current = self
            .shared
            .cache
            .get(&key)
            .map(|entry| TestSuiteRun::clone(entry.value()));

        let next = match apply(&event, current) {
            Ok(run) => Arc::new(run),
            // Hook callbacks may outlive the cache entry of a persisted run.
            Err(e @ EngineError::UnknownRun { .. }) if matches!(event, Event::ContextMerged { .. }) => {
                warn!("Late context for evicted run: {}", e);
                return Err(e);
            }
            Err(e) => {
                error!("{}", e);
                return Err(e);
            }
        };

        self.shared.cache.insert(key.clone(), next.clone());
        debug!("Applied {}", event);

        match event {
            Event::RunStarted { .. } => self.start_executor(next.clone()),
            Event::RunFinished { .. } => {
                self.shared.unflushed.insert(key);
                self.evict_finished();
            }
            _ => {}
        }

        Ok(next)
    }

    fn start_executor(&self, run: Arc<TestSuiteRun>) {
        let key = run.key();
        let Some(suite) = self.shared.suites.get(&run.suite).cloned() else {
            error!("No suite registered for run {}", key);
            return;
        };

        let tracked = self.shared.suite_runs.enter();
        let running = self.shared.metrics.suite_running();
        let executor = SuiteExecutor::new(self.shared.clone(), self.handle.clone(), suite, key.clone());
        let shared = self.shared.clone();
        let task_key = key.clone();

        // Abortable until persistence and suite hooks are done, not just until
        // RunFinished.
        let task = tokio::spawn(async move {
            let _tracked = tracked;
            let _running = running;
            executor.run().await;
            shared.aborts.remove(&task_key);
        });
        // The executor's first event waits on this loop, so it cannot finish
        // before the handle is registered.
        self.shared.aborts.insert(key, task.abort_handle());
    }

    /// Drop the oldest persisted terminal runs beyond the retention limit
    fn evict_finished(&self) {
        let retained = self.shared.config.retained_runs;
        let mut finished: Vec<_> = self
            .shared
            .cache
            .iter()
            .filter(|entry| entry.value().is_terminal() && !self.shared.unflushed.contains(entry.key()))
            .map(|entry| (entry.value().ended_at, entry.key().clone()))
            .collect();

        if finished.len() <= retained {
            return;
        }

        finished.sort();
        let excess = finished.len() - retained;
        for (_, key) in finished.into_iter().take(excess) {
            self.shared.cache.remove(&key);
            debug!("Evicted {} from run cache", key);
        }
    }
}
