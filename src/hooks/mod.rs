//! Run observers
//!
//! A hook is registered under one or more listener roles:
//!
//! - [`TestFinishedHook`] / [`SuiteFinishedHook`] are awaited in line by the
//!   suite executor, so their side effects land before the run moves on.
//! - [`TestFinishedAsyncHook`] / [`SuiteFinishedAsyncHook`] run on their own
//!   task and may contribute context back through a [`HookCallback`].
//!
//! ```ignore
//! let registration = HookRegistration::new(LogHook::new())
//!     .on_test_finished()
//!     .on_suite_finished();
//! ```

mod log;
mod manager;
mod webhook;

pub use log::LogHook;
pub(crate) use manager::HookManager;
pub use webhook::{WebhookHook, WebhookPayload};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dispatcher::{DispatcherHandle, Event, MergeTarget};
use crate::models::{RunContext, RunKey, TestRun, TestSuite, TestSuiteRun};
use crate::storage::Storage;

/// Base contract of every observer
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Called once while the engine is built
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait TestFinishedHook: Hook {
    async fn test_finished(&self, suite: &TestSuite, run: &TestSuiteRun, test: &TestRun);
}

#[async_trait]
pub trait TestFinishedAsyncHook: Hook {
    async fn test_finished_async(
        &self,
        suite: Arc<TestSuite>,
        run: Arc<TestSuiteRun>,
        test: TestRun,
        callback: HookCallback,
    );
}

#[async_trait]
pub trait SuiteFinishedHook: Hook {
    async fn suite_finished(&self, suite: &TestSuite, run: &TestSuiteRun);
}

#[async_trait]
pub trait SuiteFinishedAsyncHook: Hook {
    async fn suite_finished_async(
        &self,
        suite: Arc<TestSuite>,
        run: Arc<TestSuiteRun>,
        callback: HookCallback,
    );
}

#[derive(Clone, Default)]
pub(crate) struct HookRoles {
    pub test_finished: Option<Arc<dyn TestFinishedHook>>,
    pub test_finished_async: Option<Arc<dyn TestFinishedAsyncHook>>,
    pub suite_finished: Option<Arc<dyn SuiteFinishedHook>>,
    pub suite_finished_async: Option<Arc<dyn SuiteFinishedAsyncHook>>,
}

impl HookRoles {
    fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.test_finished.is_some() {
            names.push("test_finished");
        }
        if self.test_finished_async.is_some() {
            names.push("test_finished_async");
        }
        if self.suite_finished.is_some() {
            names.push("suite_finished");
        }
        if self.suite_finished_async.is_some() {
            names.push("suite_finished_async");
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

/// A hook plus the roles it listens under
pub struct HookRegistration<H: Hook + 'static> {
    hook: Arc<H>,
    roles: HookRoles,
}

impl<H: Hook + 'static> HookRegistration<H> {
    pub fn new(hook: H) -> Self {
        Self::from_arc(Arc::new(hook))
    }

    pub fn from_arc(hook: Arc<H>) -> Self {
        Self {
            hook,
            roles: HookRoles::default(),
        }
    }
}

impl<H: TestFinishedHook + 'static> HookRegistration<H> {
    pub fn on_test_finished(mut self) -> Self {
        let role: Arc<dyn TestFinishedHook> = self.hook.clone();
        self.roles.test_finished = Some(role);
        self
    }
}

impl<H: TestFinishedAsyncHook + 'static> HookRegistration<H> {
    pub fn on_test_finished_async(mut self) -> Self {
        let role: Arc<dyn TestFinishedAsyncHook> = self.hook.clone();
        self.roles.test_finished_async = Some(role);
        self
    }
}

impl<H: SuiteFinishedHook + 'static> HookRegistration<H> {
    pub fn on_suite_finished(mut self) -> Self {
        let role: Arc<dyn SuiteFinishedHook> = self.hook.clone();
        self.roles.suite_finished = Some(role);
        self
    }
}

impl<H: SuiteFinishedAsyncHook + 'static> HookRegistration<H> {
    pub fn on_suite_finished_async(mut self) -> Self {
        let role: Arc<dyn SuiteFinishedAsyncHook> = self.hook.clone();
        self.roles.suite_finished_async = Some(role);
        self
    }
}

/// Type-erased registration held by the manager
#[derive(Clone)]
pub(crate) struct RegisteredHook {
    pub name: String,
    pub base: Arc<dyn Hook>,
    pub roles: HookRoles,
}

impl<H: Hook + 'static> From<HookRegistration<H>> for RegisteredHook {
    fn from(registration: HookRegistration<H>) -> Self {
        let base: Arc<dyn Hook> = registration.hook;
        Self {
            name: base.name().to_string(),
            base,
            roles: registration.roles,
        }
    }
}

impl fmt::Debug for RegisteredHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHook")
            .field("name", &self.name)
            .field("roles", &self.roles.names())
            .finish()
    }
}

/// What a callback needs to merge context back into a run
#[derive(Clone)]
pub(crate) struct CallbackSink {
    dispatcher: DispatcherHandle,
    storage: Arc<dyn Storage>,
}

impl CallbackSink {
    pub(crate) fn new(dispatcher: DispatcherHandle, storage: Arc<dyn Storage>) -> Self {
        Self { dispatcher, storage }
    }
}

/// Handed to asynchronous hooks to contribute context to the run.
///
/// Completing is optional. The merge is best-effort and may land after the
/// run's final state was persisted.
pub struct HookCallback {
    hook: String,
    key: RunKey,
    target: MergeTarget,
    sink: CallbackSink,
}

impl HookCallback {
    pub(crate) fn new(hook: &str, key: RunKey, target: MergeTarget, sink: CallbackSink) -> Self {
        Self {
            hook: hook.to_string(),
            key,
            target,
            sink,
        }
    }

    pub fn hook(&self) -> &str {
        &self.hook
    }

    pub fn key(&self) -> &RunKey {
        &self.key
    }

    /// Merge `context` into the test attempt or suite run this callback targets
    pub async fn complete(self, context: RunContext) {
        if context.is_empty() {
            return;
        }

        let event = Event::ContextMerged {
            key: self.key.clone(),
            target: self.target.clone(),
            context,
        };
        let run = match self.sink.dispatcher.submit(event).await {
            Ok(run) => run,
            Err(e) => {
                warn!("Context from hook '{}' for {} dropped: {}", self.hook, self.key, e);
                return;
            }
        };

        let persisted = match &self.target {
            MergeTarget::Suite => self.sink.storage.update_suite_run(&run).await,
            MergeTarget::Test { name, attempt } => match run.attempt(name, *attempt) {
                Some(test) => self.sink.storage.update_test_run(test).await,
                None => Ok(()),
            },
        };

        match persisted {
            Ok(()) => debug!("Merged context from hook '{}' into {}", self.hook, self.key),
            Err(e) => warn!(
                "Context from hook '{}' merged into {} but not persisted: {}",
                self.hook, self.key, e
            ),
        }
    }
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookCallback")
            .field("hook", &self.hook)
            .field("key", &self.key)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl Hook for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }
    }

    #[async_trait]
    impl SuiteFinishedHook for Quiet {
        async fn suite_finished(&self, _suite: &TestSuite, _run: &TestSuiteRun) {}
    }

    #[test]
    fn test_registration_records_roles() {
        let registered: RegisteredHook = HookRegistration::new(Quiet).on_suite_finished().into();
        assert_eq!(registered.name, "quiet");
        assert_eq!(registered.roles.names(), vec!["suite_finished"]);
        assert!(!registered.roles.is_empty());
    }

    #[test]
    fn test_registration_without_roles_is_empty() {
        let registered: RegisteredHook = HookRegistration::new(Quiet).into();
        assert!(registered.roles.is_empty());
    }
}
