//! HTTP check suites
//!
//! Turns the suites declared in the configuration file into [`TestSuite`]s.
//! Every check becomes one test that issues a request and asserts on the
//! status code and, optionally, the body.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{CheckConfig, CheckSuiteConfig};
use crate::http::{HttpClient, HttpRequest};
use crate::models::TestSuite;
use crate::tb::Tb;

/// Build a suite from its configuration
pub fn build_suite(config: &CheckSuiteConfig) -> Result<TestSuite> {
    let client = if config.insecure {
        HttpClient::insecure(config.request_timeout_secs)?
    } else {
        HttpClient::with_timeout(config.request_timeout_secs)?
    };

    let mut builder = TestSuite::builder(config.name.clone());
    if let Some(service) = &config.service {
        builder = builder.service(service.clone());
    }
    if let Some(attempts) = config.max_attempts {
        builder = builder.max_attempts(attempts);
    }
    if let Some(secs) = config.timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    if let Some(url) = config.setup.clone() {
        let client = client.clone();
        builder = builder.setup(move || probe(client.clone(), url.clone()));
    }

    for check in &config.checks {
        let name = check.name.clone();
        let soft_failure = check.soft_failure;
        let check = Arc::new(check.clone());
        let client = client.clone();
        let run = move |tb: Tb| run_check(client.clone(), check.clone(), tb);
        builder = if soft_failure {
            builder.soft_test(name, run)
        } else {
            builder.test(name, run)
        };
    }

    builder
        .build()
        .with_context(|| format!("Invalid check suite '{}'", config.name))
}

/// Setup: the probe URL must answer 2xx
async fn probe(client: HttpClient, url: String) -> Result<()> {
    let response = client
        .get(&url)
        .await
        .with_context(|| format!("probe {url}"))?;
    if !response.is_success() {
        bail!("probe {} answered {}", url, response.status_code);
    }
    debug!("Probe {} answered {}", url, response.status_code);
    Ok(())
}

async fn run_check(client: HttpClient, check: Arc<CheckConfig>, tb: Tb) {
    let mut request = HttpRequest::new(check.method.clone(), check.url.clone());
    for (key, value) in &check.headers {
        request = request.header(key.clone(), value.clone());
    }

    let response = match client.send(request).await {
        Ok(response) => response,
        Err(e) => tb.fatal(format!("{} {}: {:#}", check.method, check.url, e)),
    };

    tb.set_context("status", response.status_code);
    tb.set_context("duration_ms", response.duration_ms);
    tb.log(format!(
        "{} {} -> {} in {}ms",
        check.method, check.url, response.status_code, response.duration_ms
    ));

    if response.status_code != check.expected_status {
        tb.error(format!(
            "expected status {}, got {}",
            check.expected_status, response.status_code
        ));
    }

    if let Some(needle) = &check.body_contains {
        if !response.body_contains(needle) {
            tb.error(format!("body does not contain {needle:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::execute_test;
    use crate::metrics::Metrics;
    use crate::models::{RunKey, RunResult, TestRun};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `/ok` with 200 and a body, anything else with 503
    async fn server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let response = if request.starts_with("GET /ok ") {
                        "HTTP/1.1 200 OK\r\nContent-Length: 17\r\nConnection: close\r\n\r\n{\"version\":\"1.2\"}"
                    } else {
                        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn suite_config(base: &str, checks: Vec<CheckConfig>) -> CheckSuiteConfig {
        CheckSuiteConfig {
            name: "smoke".to_string(),
            service: Some("api".to_string()),
            max_attempts: Some(2),
            timeout_secs: Some(30),
            schedule_secs: None,
            setup: Some(format!("{base}/ok")),
            request_timeout_secs: 5,
            insecure: false,
            checks,
        }
    }

    async fn execute(suite: &TestSuite, name: &str) -> TestRun {
        let pending = TestRun::pending(&RunKey::new(suite.name.clone(), 1), name, 1, false);
        execute_test(suite, &pending, None, &Metrics::new()).await.record
    }

    #[test]
    fn test_build_suite_shape() {
        let mut soft = CheckConfig::get("metrics", "http://localhost/metrics");
        soft.soft_failure = true;
        let config = suite_config(
            "http://localhost",
            vec![CheckConfig::get("health", "http://localhost/healthz"), soft],
        );

        let suite = build_suite(&config).unwrap();
        assert_eq!(suite.name, "smoke");
        assert_eq!(suite.service.as_deref(), Some("api"));
        assert_eq!(suite.max_attempts, Some(2));
        assert_eq!(suite.timeout, Some(Duration::from_secs(30)));
        assert!(suite.setup.is_some());
        assert!(!suite.test("health").unwrap().soft_failure);
        assert!(suite.test("metrics").unwrap().soft_failure);
    }

    #[tokio::test]
    async fn test_check_passes_and_records_status() {
        let base = server().await;
        let mut check = CheckConfig::get("version", format!("{base}/ok"));
        check.body_contains = Some("\"version\"".to_string());
        let suite = build_suite(&suite_config(&base, vec![check])).unwrap();

        let record = execute(&suite, "version").await;
        assert_eq!(record.result, RunResult::Passed, "logs: {}", record.logs);
        assert_eq!(record.context["status"], 200);
    }

    #[tokio::test]
    async fn test_check_fails_on_status_and_body() {
        let base = server().await;
        let mut check = CheckConfig::get("down", format!("{base}/down"));
        check.body_contains = Some("ready".to_string());
        let suite = build_suite(&suite_config(&base, vec![check])).unwrap();

        let record = execute(&suite, "down").await;
        assert_eq!(record.result, RunResult::Failed);
        assert!(record.logs.contains("expected status 200, got 503"));
        assert!(record.logs.contains("body does not contain"));
    }

    #[tokio::test]
    async fn test_unreachable_check_fails() {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let check = CheckConfig::get("gone", format!("http://{addr}/"));
        let suite = build_suite(&suite_config("http://unused", vec![check])).unwrap();

        let record = execute(&suite, "gone").await;
        assert_eq!(record.result, RunResult::Failed);
        assert!(record.logs.contains(&format!("GET http://{addr}/")));
    }

    #[tokio::test]
    async fn test_probe_requires_success() {
        let base = server().await;
        let client = HttpClient::with_timeout(5).unwrap();
        assert!(probe(client.clone(), format!("{base}/ok")).await.is_ok());

        let err = probe(client, format!("{base}/down")).await.unwrap_err();
        assert!(err.to_string().contains("answered 503"));
    }
}
