//! Test handlers and the registry that maps test names to them.
//!
//! The registry is built once before launch and checked against the
//! scheduled groups, so a worker never discovers a missing handler after its
//! cluster has been paid for.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::catalog::{Catalog, ManifestSpec};
use crate::error::{SuiteError, SuiteResult};
use crate::scheduler::ClusterGroup;

/// Everything a test body needs to reach its cluster.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Test name.
    pub test: String,
    /// Cluster group the test runs on.
    pub group: String,
    /// Kubeconfig of the cluster.
    pub kubeconfig: PathBuf,
    /// Directory for raw output (`detailed/<test>`).
    pub output_dir: PathBuf,
    /// Master node address, when this run provisioned the cluster.
    pub master_address: Option<String>,
}

/// Verdict of a test body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one test body.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub status: TestStatus,
    /// Free-form metrics reported by the test.
    pub metrics: serde_json::Value,
}

impl TestOutcome {
    #[must_use]
    pub fn passed(metrics: serde_json::Value) -> Self {
        Self {
            status: TestStatus::Passed,
            metrics,
        }
    }

    #[must_use]
    pub fn failed(metrics: serde_json::Value) -> Self {
        Self {
            status: TestStatus::Failed,
            metrics,
        }
    }
}

/// A test body runnable against a ready cluster.
#[async_trait]
pub trait TestHandler: Send + Sync {
    /// Run the test. An `Err` means the test could not be carried out at all.
    async fn run(&self, ctx: &TestContext) -> Result<TestOutcome>;
}

/// Name-indexed set of test handlers.
#[derive(Clone, Default)]
pub struct TestRegistry {
    handlers: BTreeMap<String, Arc<dyn TestHandler>>,
}

impl std::fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRegistry")
            .field("tests", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding a [`ManifestTest`] for every catalog entry that
    /// describes one.
    #[must_use]
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut registry = Self::new();
        for test in catalog.tests.values() {
            if let Some(spec) = &test.manifest {
                registry.register(&test.name, Arc::new(ManifestTest::new(spec.clone())));
            }
        }
        registry
    }

    /// Add or replace the handler for `name`.
    pub fn register(&mut self, name: &str, handler: Arc<dyn TestHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TestHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Check that every scheduled test has a handler.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::UnregisteredTests`] listing the tests without one.
    pub fn validate(&self, groups: &[ClusterGroup]) -> SuiteResult<()> {
        let missing: BTreeSet<&String> = groups
            .iter()
            .flat_map(|g| &g.members)
            .filter(|t| !self.handlers.contains_key(*t))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SuiteError::UnregisteredTests(
                missing.into_iter().cloned().collect(),
            ))
        }
    }
}

/// Test that deploys a manifest and waits for one of its Jobs.
///
/// The Job's logs are saved as `job.log` in the test output directory; the
/// last log line that parses as JSON becomes the metric payload.
#[derive(Debug, Clone)]
pub struct ManifestTest {
    spec: ManifestSpec,
    kubectl: String,
}

impl ManifestTest {
    #[must_use]
    pub fn new(spec: ManifestSpec) -> Self {
        Self {
            spec,
            kubectl: "kubectl".to_string(),
        }
    }

    fn kubectl(&self, ctx: &TestContext) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("--kubeconfig").arg(&ctx.kubeconfig);
        cmd
    }

    fn job_ref(&self) -> String {
        format!("job/{}", self.spec.job)
    }
}

/// Last line of `logs` that is a JSON object.
#[must_use]
pub fn last_json_line(logs: &str) -> Option<serde_json::Value> {
    logs.lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .find(serde_json::Value::is_object)
}

#[async_trait]
impl TestHandler for ManifestTest {
    async fn run(&self, ctx: &TestContext) -> Result<TestOutcome> {
        let tag = format!("{}/{}", ctx.group, ctx.test);
        std::fs::create_dir_all(&ctx.output_dir)
            .with_context(|| format!("creating {}", ctx.output_dir.display()))?;

        let mut apply = self.kubectl(ctx);
        apply.arg("apply").arg("-f").arg(&self.spec.path);
        let applied = provision::process::stream_command(apply, "kubectl", &tag, None).await?;
        if !applied.status.success() {
            anyhow::bail!(
                "kubectl apply -f {} failed: {}",
                self.spec.path.display(),
                applied.tail.last().map_or("no output", String::as_str)
            );
        }

        info!(test = %ctx.test, job = %self.spec.job, "Waiting for job completion");
        let timeout = Duration::from_secs(self.spec.timeout_secs);
        let mut wait = self.kubectl(ctx);
        wait.args(["wait", "--for=condition=complete"])
            .arg(self.job_ref())
            .args(["-n", self.spec.namespace.as_str()])
            .arg(format!("--timeout={}s", timeout.as_secs()));
        let completed = provision::process::stream_command(wait, "kubectl", &tag, None)
            .await?
            .status
            .success();

        let logs = self
            .kubectl(ctx)
            .arg("logs")
            .arg(self.job_ref())
            .args(["-n", self.spec.namespace.as_str()])
            .output()
            .await
            .context("running kubectl logs")?;
        let logs = String::from_utf8_lossy(&logs.stdout);
        std::fs::write(ctx.output_dir.join("job.log"), logs.as_bytes())
            .context("saving job logs")?;

        let metrics = last_json_line(&logs).unwrap_or(serde_json::Value::Null);
        if completed {
            Ok(TestOutcome::passed(metrics))
        } else {
            warn!(test = %ctx.test, job = %self.spec.job, "Job did not complete in time");
            Ok(TestOutcome::failed(metrics))
        }
    }
}
