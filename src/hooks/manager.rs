//! Hook dispatch

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{CallbackSink, HookCallback, RegisteredHook};
use crate::dispatcher::MergeTarget;
use crate::error::EngineError;
use crate::executor::{guarded, panic_message, Guarded};
use crate::models::{TestRun, TestSuite, TestSuiteRun};
use crate::utils::InFlight;

/// Fans lifecycle notifications out to registered hooks
#[derive(Debug, Default)]
pub(crate) struct HookManager {
    hooks: Vec<RegisteredHook>,
    in_flight: InFlight,
}

impl HookManager {
    /// Validate roles and initialize every hook
    pub(crate) fn new(hooks: Vec<RegisteredHook>) -> Result<Self, EngineError> {
        for hook in &hooks {
            if hook.roles.is_empty() {
                return Err(EngineError::HookRegistration(hook.name.clone()));
            }
            hook.base.init().map_err(|source| EngineError::HookInit {
                name: hook.name.clone(),
                source,
            })?;
            info!("Registered hook '{}' as {:?}", hook.name, hook.roles.names());
        }

        Ok(Self {
            hooks,
            in_flight: InFlight::new(),
        })
    }

    pub(crate) fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name.as_str()).collect()
    }

    /// Asynchronous notifications still running
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    pub(crate) async fn drain(&self) {
        let outstanding = self.in_flight();
        if outstanding > 0 {
            info!("Waiting for {} asynchronous hook calls", outstanding);
        }
        self.in_flight.wait().await;
    }

    /// Notify that one attempt finished: in-line roles first, then async ones
    pub(crate) async fn test_finished(
        &self,
        suite: &Arc<TestSuite>,
        run: &Arc<TestSuiteRun>,
        test: &TestRun,
        sink: &CallbackSink,
    ) {
        for hook in &self.hooks {
            if let Some(role) = &hook.roles.test_finished {
                let call = role.test_finished(suite, run, test);
                if let Guarded::Panicked(payload) = guarded(call, None).await {
                    error!(
                        "Hook '{}' panicked in test_finished: {}",
                        hook.name,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        for hook in &self.hooks {
            if let Some(role) = hook.roles.test_finished_async.clone() {
                let callback = HookCallback::new(
                    &hook.name,
                    test.key(),
                    MergeTarget::Test {
                        name: test.name.clone(),
                        attempt: test.attempt,
                    },
                    sink.clone(),
                );
                let (suite, run, test) = (suite.clone(), run.clone(), test.clone());
                self.spawn(&hook.name, async move {
                    role.test_finished_async(suite, run, test, callback).await
                });
            }
        }
    }

    /// Notify that a run reached its terminal state
    pub(crate) async fn suite_finished(
        &self,
        suite: &Arc<TestSuite>,
        run: &Arc<TestSuiteRun>,
        sink: &CallbackSink,
    ) {
        for hook in &self.hooks {
            if let Some(role) = &hook.roles.suite_finished {
                let call = role.suite_finished(suite, run);
                if let Guarded::Panicked(payload) = guarded(call, None).await {
                    error!(
                        "Hook '{}' panicked in suite_finished: {}",
                        hook.name,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        for hook in &self.hooks {
            if let Some(role) = hook.roles.suite_finished_async.clone() {
                let callback = HookCallback::new(&hook.name, run.key(), MergeTarget::Suite, sink.clone());
                let (suite, run) = (suite.clone(), run.clone());
                self.spawn(&hook.name, async move {
                    role.suite_finished_async(suite, run, callback).await
                });
            }
        }
    }

    fn spawn<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.in_flight.enter();
        let name = name.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            match guarded(fut, None).await {
                Guarded::Panicked(payload) => error!(
                    "Asynchronous hook '{}' panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                ),
                _ => debug!("Asynchronous hook '{}' done", name),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Hook, HookRegistration, SuiteFinishedHook};
    use async_trait::async_trait;

    struct Failing;

    impl Hook for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn init(&self) -> anyhow::Result<()> {
            anyhow::bail!("missing token")
        }
    }

    #[async_trait]
    impl SuiteFinishedHook for Failing {
        async fn suite_finished(&self, _suite: &TestSuite, _run: &TestSuiteRun) {}
    }

    #[test]
    fn test_rejects_hook_without_roles() {
        let err = HookManager::new(vec![HookRegistration::new(Failing).into()]).unwrap_err();
        assert!(matches!(err, EngineError::HookRegistration(name) if name == "failing"));
    }

    #[test]
    fn test_init_failure_surfaces() {
        let registration = HookRegistration::new(Failing).on_suite_finished();
        let err = HookManager::new(vec![registration.into()]).unwrap_err();
        assert!(matches!(err, EngineError::HookInit { .. }));
        assert!(err.to_string().contains("missing token"));
    }

    #[tokio::test]
    async fn test_drain_with_nothing_in_flight() {
        let manager = HookManager::default();
        manager.drain().await;
        assert_eq!(manager.in_flight(), 0);
        assert!(manager.names().is_empty());
    }
}
