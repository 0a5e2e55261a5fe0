//! Webhook notification hook
//!
//! Posts a JSON summary of every finished run to a URL and records the
//! response status on the run's context as `<name>_status`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Hook, HookCallback, SuiteFinishedAsyncHook};
use crate::http::{HttpClient, HttpRequest};
use crate::models::{RunContext, RunResult, RunSummary, TestSuite, TestSuiteRun};

/// Body posted to the webhook URL
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub suite: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<&'a str>,
    pub run_id: u64,
    pub result: RunResult,
    pub flaky: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub summary: RunSummary,
    pub failed_tests: Vec<&'a str>,
}

impl<'a> WebhookPayload<'a> {
    pub fn from_run(run: &'a TestSuiteRun) -> Self {
        let failed_tests = run
            .latest_attempts()
            .into_iter()
            .filter(|t| t.result == RunResult::Failed)
            .map(|t| t.name.as_str())
            .collect();

        Self {
            suite: &run.suite,
            service: run.service.as_deref(),
            run_id: run.id,
            result: run.result.reported(),
            flaky: run.flaky,
            duration_ms: run.duration_ms,
            summary: run.summary(),
            failed_tests,
        }
    }
}

/// Asynchronous suite-finished hook that posts to a URL
#[derive(Clone)]
pub struct WebhookHook {
    name: String,
    url: String,
    client: HttpClient,
}

impl WebhookHook {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(name, url, 10)
    }

    pub fn with_timeout(name: impl Into<String>, url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client: HttpClient::with_timeout(timeout_secs)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post the run summary and return the response status
    pub async fn post_summary(&self, run: &TestSuiteRun) -> Result<u16> {
        let body = serde_json::to_string(&WebhookPayload::from_run(run))?;
        let request = HttpRequest::post(&self.url)
            .header("Content-Type", "application/json")
            .body(body);

        let response = self.client.send(request).await?;
        debug!("Webhook '{}' answered {} for {}", self.name, response.status_code, run.key());
        Ok(response.status_code)
    }
}

impl std::fmt::Debug for WebhookHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookHook")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

impl Hook for WebhookHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            bail!("webhook URL must be http(s): {}", self.url);
        }
        Ok(())
    }
}

#[async_trait]
impl SuiteFinishedAsyncHook for WebhookHook {
    async fn suite_finished_async(
        &self,
        _suite: Arc<TestSuite>,
        run: Arc<TestSuiteRun>,
        callback: HookCallback,
    ) {
        match self.post_summary(&run).await {
            Ok(status) => {
                let mut context = RunContext::new();
                context.insert(format!("{}_status", self.name), status.into());
                callback.complete(context).await;
            }
            Err(e) => warn!("Webhook '{}' failed for {}: {:#}", self.name, run.key(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunParams;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn finished_run() -> TestSuiteRun {
        let suite = TestSuite::builder("hooks")
            .service("billing")
            .test("ok", |_t| async {})
            .test("broken", |_t| async {})
            .build()
            .unwrap();
        let mut run = TestSuiteRun::seed(&suite, 4, RunParams::manual(), None, Utc::now());
        run.tests[0].result = RunResult::Passed;
        run.tests[1].result = RunResult::Failed;
        run.result = RunResult::Failed;
        run
    }

    #[test]
    fn test_payload_lists_failures() {
        let run = finished_run();
        let json = serde_json::to_value(WebhookPayload::from_run(&run)).unwrap();
        assert_eq!(json["suite"], "hooks");
        assert_eq!(json["service"], "billing");
        assert_eq!(json["result"], "failed");
        assert_eq!(json["failed_tests"][0], "broken");
        assert_eq!(json["summary"]["passed"], 1);
    }

    #[test]
    fn test_init_rejects_non_http_url() {
        let hook = WebhookHook::new("chat", "ftp://example.com").unwrap();
        assert!(hook.init().is_err());
        let hook = WebhookHook::new("chat", "https://example.com/hook").unwrap();
        assert!(hook.init().is_ok());
    }

    #[tokio::test]
    async fn test_post_summary_returns_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let hook = WebhookHook::new("chat", format!("http://{addr}/notify")).unwrap();
        let status = hook.post_summary(&finished_run()).await.unwrap();
        assert_eq!(status, 202);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /notify"));
    }
}
