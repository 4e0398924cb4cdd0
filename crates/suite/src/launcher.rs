//! Concurrent per-group workers.
//!
//! One Tokio task per cluster group runs gate → pipeline → tests and sends
//! exactly one [`WorkerReport`] into an unbounded queue. Workers share only
//! read-only state; a failing or panicking worker still reports.
//!
//! The queue can only be read through a [`JoinedRun`], which exists only
//! after every worker has terminated.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::aggregator::TestResultEntry;
use crate::config::RunConfig;
use crate::cost::{Cost, CostEstimator, ResourceUsage};
use crate::pipeline::{BillableClock, ProvisionStage, ProvisioningPipeline, Toolchain};
use crate::registry::{TestContext, TestOutcome, TestRegistry, TestStatus};
use crate::retry::RetryCleanupManager;
use crate::scheduler::ClusterGroup;

/// The single message a worker produces.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    /// Group the worker was responsible for.
    pub group: String,
    /// Results, absent when tests never ran.
    pub entry: Option<TestResultEntry>,
    /// Infrastructure cost of the group.
    pub cost: Cost,
    /// Failure description, if the worker did not complete normally.
    pub message: Option<String>,
}

/// Shared state handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<RunConfig>,
    pub tools: Arc<Toolchain>,
    pub registry: Arc<TestRegistry>,
    pub estimator: Arc<dyn CostEstimator>,
    /// `detailed/` directory of the run.
    pub detailed_dir: PathBuf,
}

/// Spawns workers for a set of cluster groups.
pub struct ProcessLauncher {
    context: WorkerContext,
}

impl ProcessLauncher {
    #[must_use]
    pub fn new(context: WorkerContext) -> Self {
        Self { context }
    }

    /// Start one worker per group.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn launch(&self, groups: &[ClusterGroup]) -> LaunchedRun {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for group in groups {
            let worker = Worker {
                context: self.context.clone(),
                group: group.clone(),
            };
            let tx = tx.clone();
            workers.spawn(async move {
                let report = worker.run_guarded().await;
                if tx.send(report).is_err() {
                    error!("Result queue closed before report was sent");
                }
            });
        }
        info!(workers = groups.len(), "Workers launched");

        LaunchedRun {
            workers,
            rx,
            launched: groups.len(),
        }
    }
}

/// Workers in flight.
pub struct LaunchedRun {
    workers: JoinSet<()>,
    rx: mpsc::UnboundedReceiver<WorkerReport>,
    launched: usize,
}

impl LaunchedRun {
    #[must_use]
    pub fn launched(&self) -> usize {
        self.launched
    }

    /// Wait for every worker to terminate.
    pub async fn join(mut self) -> JoinedRun {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task did not complete");
            }
        }
        JoinedRun {
            rx: self.rx,
            launched: self.launched,
        }
    }
}

/// All workers have terminated; the queue is complete.
pub struct JoinedRun {
    rx: mpsc::UnboundedReceiver<WorkerReport>,
    launched: usize,
}

impl JoinedRun {
    #[must_use]
    pub fn launched(&self) -> usize {
        self.launched
    }

    /// Every report, in arrival order.
    #[must_use]
    pub fn into_reports(mut self) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(self.launched);
        while let Ok(report) = self.rx.try_recv() {
            reports.push(report);
        }
        reports
    }
}

struct Worker {
    context: WorkerContext,
    group: ClusterGroup,
}

impl Worker {
    async fn run_guarded(self) -> WorkerReport {
        let clock = BillableClock::default();
        match AssertUnwindSafe(self.run(&clock)).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                let message = format!("worker panicked: {}", panic_message(panic.as_ref()));
                error!(group = %self.group.id, "{message}");
                WorkerReport {
                    group: self.group.id.clone(),
                    entry: None,
                    cost: self.cost(clock.since()),
                    message: Some(message),
                }
            }
        }
    }

    async fn run(&self, clock: &BillableClock) -> WorkerReport {
        let config = &self.context.config;
        let decision = RetryCleanupManager::new(config).gate(&self.group);

        let master_address = match ProvisionStage::entry_for(decision) {
            Some(entry) => {
                let outcome = ProvisioningPipeline::new(config, &self.context.tools, &self.group)
                    .with_clock(clock.clone())
                    .run(entry)
                    .await;

                if !outcome.success {
                    return WorkerReport {
                        group: self.group.id.clone(),
                        entry: None,
                        cost: self.cost(clock.since()),
                        message: Some(outcome.message),
                    };
                }
                info!(group = %self.group.id, "{}", outcome.message);
                outcome.master_address
            }
            None => None,
        };

        let provisioned = master_address.is_some();
        let outcomes = self.run_tests(master_address).await;
        let cost = self.cost(clock.since());

        let status = if outcomes.iter().all(|(_, o)| o.status == TestStatus::Passed) {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };
        let metrics: serde_json::Map<String, serde_json::Value> = outcomes
            .into_iter()
            .map(|(test, o)| (test, json!({ "status": o.status, "metrics": o.metrics })))
            .collect();

        WorkerReport {
            group: self.group.id.clone(),
            entry: Some(TestResultEntry {
                test: self.group.id.clone(),
                cluster: self.group.id.clone(),
                provisioned,
                cost: cost.value(),
                status,
                metrics: serde_json::Value::Object(metrics),
            }),
            cost,
            message: None,
        }
    }

    /// Run every member test concurrently against the group's cluster.
    async fn run_tests(&self, master_address: Option<String>) -> Vec<(String, TestOutcome)> {
        let runs = self.group.members.iter().map(|test| {
            let ctx = TestContext {
                test: test.clone(),
                group: self.group.id.clone(),
                kubeconfig: self.context.config.kubeconfig_path(&self.group.id),
                output_dir: self.context.detailed_dir.join(test),
                master_address: master_address.clone(),
            };
            let handler = self.context.registry.get(test);

            async move {
                let Some(handler) = handler else {
                    return (ctx.test, failed_outcome("no handler registered"));
                };
                info!(group = %ctx.group, test = %ctx.test, "Running test");

                let outcome = match AssertUnwindSafe(handler.run(&ctx)).catch_unwind().await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        warn!(test = %ctx.test, error = %e, "Test could not run");
                        failed_outcome(&format!("{e:#}"))
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(test = %ctx.test, "Test panicked: {message}");
                        failed_outcome(&format!("test panicked: {message}"))
                    }
                };
                (ctx.test, outcome)
            }
        });

        join_all(runs).await
    }

    fn cost(&self, billable_since: Option<Instant>) -> Cost {
        let billable = billable_since.map_or(Duration::ZERO, |since| since.elapsed());
        self.context.estimator.estimate(&ResourceUsage {
            flavor: self.context.config.flavor_for(&self.group).to_string(),
            nodes: self.group.nodes,
            billable,
        })
    }
}

fn failed_outcome(error: &str) -> TestOutcome {
    TestOutcome::failed(json!({ "error": error }))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
