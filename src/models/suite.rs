//! Static test suite definitions
//!
//! A suite is registered once when the engine is built and is read-only
//! afterwards, so definitions are shared behind `Arc` without locking.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::tb::Tb;

/// A test function. Receives the context for exactly one attempt.
pub type TestFn = Arc<dyn Fn(Tb) -> BoxFuture<'static, ()> + Send + Sync>;

/// Suite-level setup or teardown callback
pub type HookFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named test inside a suite
#[derive(Clone)]
pub struct TestDef {
    pub name: String,
    pub func: TestFn,
    /// Failures of this test never fail the suite.
    pub soft_failure: bool,
}

impl fmt::Debug for TestDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDef")
            .field("name", &self.name)
            .field("soft_failure", &self.soft_failure)
            .finish_non_exhaustive()
    }
}

/// Immutable definition of a test suite
#[derive(Clone)]
pub struct TestSuite {
    pub name: String,
    /// Associated service or namespace label
    pub service: Option<String>,
    pub setup: Option<HookFn>,
    pub teardown: Option<HookFn>,
    /// Tests in declaration order
    pub tests: Vec<TestDef>,
    /// Attempts per test when the trigger does not say otherwise
    pub max_attempts: Option<u32>,
    /// Whole-suite wall clock limit when the trigger does not say otherwise
    pub timeout: Option<Duration>,
}

impl TestSuite {
    pub fn builder(name: impl Into<String>) -> TestSuiteBuilder {
        TestSuiteBuilder::new(name)
    }

    pub fn test(&self, name: &str) -> Option<&TestDef> {
        self.tests.iter().find(|t| t.name == name)
    }

    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.tests.iter().map(|t| t.name.as_str())
    }

    /// Service label used for metrics, falling back to the suite name
    pub fn service_label(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Debug for TestSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSuite")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .field("tests", &self.tests)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builder for [`TestSuite`]
pub struct TestSuiteBuilder {
    suite: TestSuite,
}

impl TestSuiteBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            suite: TestSuite {
                name: name.into(),
                service: None,
                setup: None,
                teardown: None,
                tests: Vec::new(),
                max_attempts: None,
                timeout: None,
            },
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.suite.service = Some(service.into());
        self
    }

    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.suite.setup = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn teardown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.suite.teardown = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn test<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Tb) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_test(name.into(), false, f)
    }

    /// Add a test whose failures are recorded but never fail the suite
    pub fn soft_test<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Tb) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_test(name.into(), true, f)
    }

    fn add_test<F, Fut>(mut self, name: String, soft_failure: bool, f: F) -> Self
    where
        F: Fn(Tb) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let func: TestFn = Arc::new(move |tb| f(tb).boxed());
        self.suite.tests.push(TestDef {
            name,
            func,
            soft_failure,
        });
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.suite.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.suite.timeout = Some(timeout);
        self
    }

    /// Finish the definition, rejecting duplicate test names
    pub fn build(self) -> Result<TestSuite, EngineError> {
        let mut seen = std::collections::HashSet::new();
        for test in &self.suite.tests {
            if !seen.insert(test.name.as_str()) {
                return Err(EngineError::DuplicateTest {
                    suite: self.suite.name.clone(),
                    test: test.name.clone(),
                });
            }
        }
        Ok(self.suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_declaration_order() {
        let suite = TestSuite::builder("checkout")
            .service("shop")
            .test("b", |_t| async {})
            .test("a", |_t| async {})
            .soft_test("c", |_t| async {})
            .max_attempts(3)
            .build()
            .unwrap();

        let names: Vec<_> = suite.test_names().collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert!(suite.test("c").unwrap().soft_failure);
        assert_eq!(suite.max_attempts, Some(3));
        assert_eq!(suite.service_label(), "shop");
    }

    #[test]
    fn test_duplicate_test_rejected() {
        let err = TestSuite::builder("dup")
            .test("same", |_t| async {})
            .test("same", |_t| async {})
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTest { .. }));
    }

    #[test]
    fn test_max_attempts_floor() {
        let suite = TestSuite::builder("s").max_attempts(0).build().unwrap();
        assert_eq!(suite.max_attempts, Some(1));
        assert_eq!(suite.service_label(), "s");
    }
}
