//! Infrastructure teardown.
//!
//! Immediate teardown replaces the run entirely. On-completion teardown
//! runs after a persisted run and only touches clusters that run
//! provisioned.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use provision::InfraTool;
use tracing::{info, warn};

use crate::aggregator::AggregatedRun;
use crate::catalog::Catalog;
use crate::error::{SuiteError, SuiteResult};

/// Keyword selecting every known cluster.
pub const ALL_CLUSTERS: &str = "all";

/// Clusters a destroy request applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyTargets {
    /// The shared cluster and every custom test's cluster.
    All,
    /// Explicit cluster names.
    Clusters(Vec<String>),
}

impl DestroyTargets {
    /// Parse command-line values; `all` anywhere selects every cluster.
    #[must_use]
    pub fn from_args(args: &[String]) -> Self {
        if args.iter().any(|a| a.eq_ignore_ascii_case(ALL_CLUSTERS)) {
            Self::All
        } else {
            let mut seen = BTreeSet::new();
            Self::Clusters(
                args.iter()
                    .filter(|a| seen.insert(a.as_str()))
                    .cloned()
                    .collect(),
            )
        }
    }

    /// Concrete cluster names.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::Config`] if an explicit name is not a cluster
    /// the catalog can provision.
    pub fn resolve(&self, catalog: &Catalog) -> SuiteResult<Vec<String>> {
        let known = catalog.known_clusters();
        match self {
            Self::All => Ok(known),
            Self::Clusters(clusters) => {
                if let Some(unknown) = clusters.iter().find(|c| !known.contains(c)) {
                    return Err(SuiteError::Config(format!(
                        "Unknown cluster '{unknown}'. Choose from: {ALL_CLUSTERS}, {}",
                        known.join(", ")
                    )));
                }
                Ok(clusters.clone())
            }
        }
    }
}

/// When teardown happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyPolicy {
    /// Instead of a run.
    Immediate,
    /// After a persisted run.
    OnCompletion,
    /// Never.
    None,
}

/// What the operator asked to destroy, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyRequest {
    pub policy: DestroyPolicy,
    pub targets: DestroyTargets,
}

impl DestroyRequest {
    #[must_use]
    pub fn none() -> Self {
        Self {
            policy: DestroyPolicy::None,
            targets: DestroyTargets::Clusters(Vec::new()),
        }
    }

    #[must_use]
    pub fn immediate(targets: DestroyTargets) -> Self {
        Self {
            policy: DestroyPolicy::Immediate,
            targets,
        }
    }

    #[must_use]
    pub fn on_completion(targets: DestroyTargets) -> Self {
        Self {
            policy: DestroyPolicy::OnCompletion,
            targets,
        }
    }
}

/// Result of tearing down one cluster.
#[derive(Debug)]
pub struct TeardownReport {
    pub cluster: String,
    /// Number of artifacts removed on success.
    pub outcome: SuiteResult<usize>,
}

impl TeardownReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs teardown for clusters under the infrastructure root.
pub struct DestroyScheduler {
    infra: Arc<dyn InfraTool>,
    infra_root: PathBuf,
}

impl DestroyScheduler {
    #[must_use]
    pub fn new(infra: Arc<dyn InfraTool>, infra_root: impl Into<PathBuf>) -> Self {
        Self {
            infra,
            infra_root: infra_root.into(),
        }
    }

    /// Destroy one cluster; artifacts are deleted only if teardown completed.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::TeardownFailure`] if the cluster directory is
    /// missing or the teardown did not print its completion sentinel.
    pub async fn teardown(&self, cluster: &str) -> SuiteResult<usize> {
        let dir = self.infra_root.join(cluster);
        let failure = |message: String| SuiteError::TeardownFailure {
            cluster: cluster.to_string(),
            message,
        };

        if !dir.is_dir() {
            return Err(failure(format!("no directory at {}", dir.display())));
        }

        info!(cluster, "Destroying cluster");
        let run = self
            .infra
            .destroy(&dir, cluster)
            .await
            .map_err(|e| failure(e.to_string()))?;
        if !run.succeeded() {
            return Err(failure(run.summary()));
        }

        let removed = provision::cleanup_artifacts(&dir);
        info!(cluster, removed, "Cluster destroyed");
        Ok(removed)
    }

    /// Tear down every cluster in `clusters`.
    pub async fn destroy_now(&self, clusters: &[String]) -> Vec<TeardownReport> {
        join_all(clusters.iter().map(|cluster| async move {
            let outcome = self.teardown(cluster).await;
            if let Err(e) = &outcome {
                warn!(cluster = %cluster, error = %e, "Teardown failed");
            }
            TeardownReport {
                cluster: cluster.clone(),
                outcome,
            }
        }))
        .await
    }

    /// Tear down the requested clusters this run provisioned; others are
    /// skipped without a report.
    pub async fn on_completion(
        &self,
        clusters: &[String],
        run: &AggregatedRun,
    ) -> Vec<TeardownReport> {
        let eligible: Vec<String> = clusters
            .iter()
            .filter(|c| run.provisioned(c))
            .cloned()
            .collect();
        self.destroy_now(&eligible).await
    }
}
