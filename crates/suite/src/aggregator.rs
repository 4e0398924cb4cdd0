//! Result and cost aggregation.
//!
//! The aggregator only ever sees a [`JoinedRun`], so every worker has
//! terminated before the first report is read.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cost::Cost;
use crate::error::SuiteResult;
use crate::launcher::JoinedRun;
use crate::registry::TestStatus;

/// Timestamp format of run directories.
pub const RUN_TIMESTAMP_FORMAT: &str = "%d-%m-%Y_%H-%M-%S";

/// Name of the run artifact.
pub const ARTIFACT_FILE: &str = "general.json";

/// Directory holding per-test raw output.
pub const DETAILED_DIR: &str = "detailed";

/// One group's entry in the `testing` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultEntry {
    /// Test or group name.
    pub test: String,
    /// Cluster the tests ran on.
    pub cluster: String,
    /// Whether this run provisioned the cluster.
    pub provisioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub status: TestStatus,
    /// Per-test payloads keyed by test name.
    pub metrics: serde_json::Value,
}

/// Everything the workers reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedRun {
    /// Present entries, in arrival order.
    pub testing: Vec<TestResultEntry>,
    /// Sum of every known cost.
    pub total_cost: f64,
    /// Groups whose cost could not be estimated.
    pub unknown_cost_groups: BTreeSet<String>,
    /// Failure messages keyed by group.
    pub failures: BTreeMap<String, String>,
    /// Reports read from the queue.
    pub reports_received: usize,
}

impl AggregatedRun {
    /// Whether `cluster` appears in the testing list as provisioned by this run.
    #[must_use]
    pub fn provisioned(&self, cluster: &str) -> bool {
        self.testing
            .iter()
            .any(|e| e.cluster == cluster && e.provisioned)
    }
}

/// Descriptive data written into the artifact's `info` and `testsCatalog`.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub config: serde_json::Value,
    pub catalog: serde_json::Value,
}

/// Result of finalization.
#[derive(Debug)]
pub enum Finalization {
    /// `general.json` was written.
    Persisted {
        artifact: PathBuf,
        run: AggregatedRun,
    },
    /// No test produced output; the run directory was removed.
    Skipped,
}

/// On-disk layout of one run: `<root>/<provider>/<timestamp>/`.
#[derive(Debug, Clone)]
pub struct ResultsLayout {
    run_dir: PathBuf,
    timestamp: String,
}

impl ResultsLayout {
    #[must_use]
    pub fn new(results_root: &Path, provider: &str, started: DateTime<Local>) -> Self {
        let timestamp = started.format(RUN_TIMESTAMP_FORMAT).to_string();
        Self {
            run_dir: results_root.join(provider).join(&timestamp),
            timestamp,
        }
    }

    /// Create the run directory and its `detailed/` tree.
    ///
    /// A run never reuses another run's directory: if one already exists for
    /// this timestamp, a `_2`, `_3`, ... suffix is appended to both the
    /// directory and the timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn create(&mut self) -> SuiteResult<()> {
        let parent = self
            .run_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        std::fs::create_dir_all(&parent)?;

        let base = self.timestamp.clone();
        let mut attempt = 1u32;
        loop {
            match std::fs::create_dir(&self.run_dir) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    self.timestamp = format!("{base}_{attempt}");
                    self.run_dir = parent.join(&self.timestamp);
                }
                Err(e) => return Err(e.into()),
            }
        }
        std::fs::create_dir(self.detailed_dir())?;
        Ok(())
    }

    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    #[must_use]
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    #[must_use]
    pub fn detailed_dir(&self) -> PathBuf {
        self.run_dir.join(DETAILED_DIR)
    }

    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.run_dir.join(ARTIFACT_FILE)
    }

    /// Whether any test wrote at least one file under `detailed/`.
    #[must_use]
    pub fn has_results(&self) -> bool {
        contains_file(&self.detailed_dir())
    }

    /// Remove the run directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn discard(&self) -> SuiteResult<()> {
        if self.run_dir.exists() {
            std::fs::remove_dir_all(&self.run_dir)?;
        }
        Ok(())
    }
}

fn contains_file(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let path = entry.path();
        if path.is_dir() {
            contains_file(&path)
        } else {
            true
        }
    })
}

/// Merges worker reports into an [`AggregatedRun`].
pub struct ResultAggregator;

impl ResultAggregator {
    /// Drain every report of a joined run.
    #[must_use]
    pub fn drain(joined: JoinedRun) -> AggregatedRun {
        let launched = joined.launched();
        let mut run = AggregatedRun::default();

        for report in joined.into_reports() {
            run.reports_received += 1;

            match report.cost {
                Cost::Known(value) => run.total_cost += value,
                Cost::Unknown => {
                    run.unknown_cost_groups.insert(report.group.clone());
                }
            }
            if let Some(message) = report.message {
                run.failures.insert(report.group.clone(), message);
            }
            if let Some(entry) = report.entry {
                run.testing.push(entry);
            }
        }

        if run.reports_received != launched {
            warn!(
                launched,
                received = run.reports_received,
                "Report count does not match launched workers"
            );
        }
        debug!(
            entries = run.testing.len(),
            total_cost = run.total_cost,
            "Reports aggregated"
        );
        run
    }

    /// Persist the run, or discard it if no test produced output.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be written or the run
    /// directory cannot be removed.
    pub fn finalize(
        run: AggregatedRun,
        layout: &ResultsLayout,
        metadata: &RunMetadata,
    ) -> SuiteResult<Finalization> {
        if !layout.has_results() {
            info!(dir = %layout.run_dir().display(), "No results produced, discarding run");
            layout.discard()?;
            return Ok(Finalization::Skipped);
        }

        let artifact = layout.artifact_path();
        let document = artifact_document(&run, layout, metadata);
        std::fs::write(&artifact, serde_json::to_string_pretty(&document)?)?;
        info!(artifact = %artifact.display(), "Run results written");

        Ok(Finalization::Persisted { artifact, run })
    }
}

fn artifact_document(
    run: &AggregatedRun,
    layout: &ResultsLayout,
    metadata: &RunMetadata,
) -> serde_json::Value {
    let mut info = match &metadata.config {
        serde_json::Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("config".into(), other.clone());
            map
        }
    };
    info.insert("timestamp".into(), json!(layout.timestamp()));

    let mut document = serde_json::Map::new();
    document.insert("testing".into(), json!(run.testing));
    if run.total_cost > 0.0 {
        document.insert("estimatedCost".into(), json!(run.total_cost));
    }
    document.insert("info".into(), serde_json::Value::Object(info));
    document.insert("testsCatalog".into(), metadata.catalog.clone());
    serde_json::Value::Object(document)
}
