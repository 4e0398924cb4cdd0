//! Run orchestration.
//!
//! Coordinates one invocation of the suite:
//! - immediate teardown, which replaces the run entirely
//! - scheduling and pre-flight checks
//! - concurrent workers and the join barrier
//! - aggregation and persistence of results
//! - on-completion teardown and the optional upload

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tracing::{info, warn};

use crate::aggregator::{Finalization, ResultAggregator, ResultsLayout, RunMetadata};
use crate::config::RunConfig;
use crate::cost::CostEstimator;
use crate::destroy::{DestroyPolicy, DestroyRequest, DestroyScheduler, TeardownReport};
use crate::error::SuiteResult;
use crate::launcher::{ProcessLauncher, WorkerContext};
use crate::pipeline::Toolchain;
use crate::registry::TestRegistry;
use crate::retry::RetryCleanupManager;
use crate::scheduler::ClusterGroupScheduler;
use crate::ui;
use crate::upload::ResultUploader;

/// Summary of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    /// Workers launched.
    pub launched: usize,
    /// Reports drained from the queue.
    pub reports: usize,
    /// `general.json`, when the run was persisted.
    pub artifact: Option<PathBuf>,
    /// Sum of every known group cost.
    pub total_cost: f64,
    /// Groups whose cost could not be estimated.
    pub unknown_cost_groups: BTreeSet<String>,
    /// Failure messages keyed by group.
    pub failures: BTreeMap<String, String>,
    /// On-completion teardowns.
    pub teardowns: Vec<TeardownReport>,
    /// Upload outcome, when an upload was attempted.
    pub upload: Option<SuiteResult<()>>,
}

/// How an invocation ended.
#[derive(Debug)]
pub enum RunStatus {
    /// No test was selected.
    NothingToDo,
    /// The operator declined an immediate teardown.
    DestroyAborted,
    /// Immediate teardown ran instead of a run.
    Destroyed(Vec<TeardownReport>),
    /// Workers ran to completion.
    Completed(RunSummary),
}

/// Drives a whole invocation.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    tools: Arc<Toolchain>,
    registry: Arc<TestRegistry>,
    estimator: Arc<dyn CostEstimator>,
    uploader: Option<ResultUploader>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: RunConfig,
        tools: Toolchain,
        registry: TestRegistry,
        estimator: Arc<dyn CostEstimator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            tools: Arc::new(tools),
            registry: Arc::new(registry),
            estimator,
            uploader: None,
        }
    }

    /// Copy persisted results to remote storage.
    #[must_use]
    pub fn with_uploader(mut self, uploader: ResultUploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    fn destroy_scheduler(&self) -> DestroyScheduler {
        DestroyScheduler::new(self.tools.infra.clone(), self.config.infra_root.clone())
    }

    /// Run the invocation.
    ///
    /// `confirm` is asked before an immediate teardown when the run is
    /// interactive.
    ///
    /// # Errors
    ///
    /// Returns an error if a destroy target is unknown, a pre-flight check
    /// fails, or the results cannot be written. Worker, teardown and upload
    /// failures are reported in the returned summary instead.
    pub async fn run<F>(&self, destroy: &DestroyRequest, confirm: F) -> SuiteResult<RunStatus>
    where
        F: FnOnce(&[String]) -> bool,
    {
        let targets = match destroy.policy {
            DestroyPolicy::None => Vec::new(),
            _ => destroy.targets.resolve(&self.config.catalog)?,
        };
        if destroy.policy == DestroyPolicy::Immediate {
            return Ok(self.destroy_immediately(&targets, confirm).await);
        }

        let groups = ClusterGroupScheduler::new(&self.config.catalog, self.config.custom_nodes)
            .schedule();
        if groups.is_empty() {
            ui::print_info("No tests selected to run");
            return Ok(RunStatus::NothingToDo);
        }

        self.registry.validate(&groups)?;
        RetryCleanupManager::new(&self.config).preflight(&groups)?;

        let provider = &self.config.provider.provider_name;
        let mut layout = ResultsLayout::new(&self.config.results_root, provider, Local::now());
        layout.create()?;

        ui::print_section("Cloud Validation Test Suite");
        ui::print_kv("Provider", provider);
        ui::print_kv("Results", &layout.run_dir().display().to_string());
        for group in &groups {
            let members: Vec<&str> = group.members.iter().map(String::as_str).collect();
            ui::print_list_item(&format!(
                "{} ({} node(s)): {}",
                group.id,
                group.nodes,
                members.join(", ")
            ));
        }
        println!();

        let launcher = ProcessLauncher::new(WorkerContext {
            config: self.config.clone(),
            tools: self.tools.clone(),
            registry: self.registry.clone(),
            estimator: self.estimator.clone(),
            detailed_dir: layout.detailed_dir(),
        });
        let launched = launcher.launch(&groups);
        let launched_count = launched.launched();
        let joined = launched.join().await;
        let run = ResultAggregator::drain(joined);

        ui::print_section("TESTING COMPLETED");
        for (group, message) in &run.failures {
            ui::print_error(&format!("{group}: {message}"));
        }

        let mut summary = RunSummary {
            launched: launched_count,
            reports: run.reports_received,
            artifact: None,
            total_cost: run.total_cost,
            unknown_cost_groups: run.unknown_cost_groups.clone(),
            failures: run.failures.clone(),
            teardowns: Vec::new(),
            upload: None,
        };

        let metadata = RunMetadata {
            config: self.config.provider.snapshot()?,
            catalog: serde_json::to_value(&self.config.catalog)?,
        };

        match ResultAggregator::finalize(run, &layout, &metadata)? {
            Finalization::Skipped => {
                ui::print_warning("No results produced, run directory discarded");
            }
            Finalization::Persisted { artifact, run } => {
                Self::print_costs(&summary);
                ui::print_success(&format!("Results written to {}", artifact.display()));
                summary.artifact = Some(artifact);

                if destroy.policy == DestroyPolicy::OnCompletion {
                    summary.teardowns =
                        self.destroy_scheduler().on_completion(&targets, &run).await;
                    Self::print_teardowns(&summary.teardowns);
                }

                if let Some(uploader) = &self.uploader {
                    let result = uploader
                        .upload(layout.run_dir(), provider, layout.timestamp())
                        .await;
                    match &result {
                        Ok(()) => ui::print_success("Results uploaded"),
                        Err(e) => ui::print_warning(&e.to_string()),
                    }
                    summary.upload = Some(result);
                }
            }
        }

        ui::print_success("Run completed");
        Ok(RunStatus::Completed(summary))
    }

    async fn destroy_immediately<F>(&self, clusters: &[String], confirm: F) -> RunStatus
    where
        F: FnOnce(&[String]) -> bool,
    {
        if self.config.flags.interactive && !confirm(clusters) {
            info!("Destroy declined by operator");
            ui::print_info("Destroy aborted");
            return RunStatus::DestroyAborted;
        }

        ui::print_section("Destroying infrastructure");
        let reports = self.destroy_scheduler().destroy_now(clusters).await;
        Self::print_teardowns(&reports);
        RunStatus::Destroyed(reports)
    }

    fn print_costs(summary: &RunSummary) {
        if summary.total_cost > 0.0 {
            ui::print_kv("Estimated cost", &format!("{:.2}", summary.total_cost));
        } else {
            ui::print_warning("Costs could not be calculated");
        }
        if !summary.unknown_cost_groups.is_empty() {
            let groups: Vec<&str> = summary
                .unknown_cost_groups
                .iter()
                .map(String::as_str)
                .collect();
            warn!(groups = %groups.join(", "), "No pricing for some groups");
            ui::print_warning(&format!("Cost unknown for: {}", groups.join(", ")));
        }
    }

    fn print_teardowns(reports: &[TeardownReport]) {
        for report in reports {
            match &report.outcome {
                Ok(_) => ui::print_success(&format!("{} destroyed", report.cluster)),
                Err(e) => ui::print_warning(&e.to_string()),
            }
        }
    }
}
