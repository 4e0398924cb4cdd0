//! Tests catalog.
//!
//! The catalog lists every test the suite knows about, whether it runs in
//! this invocation, and whether it shares the common cluster or needs its own.
//!
//! ```yaml
//! tests:
//!   s3Test:
//!     run: true
//!     sharing: shared
//!   dlTest:
//!     run: true
//!     sharing: custom
//!     flavor: gpu.large
//!     nodes: 2
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SuiteError, SuiteResult};
use crate::scheduler::SHARED_GROUP;

/// How a test is placed onto infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// Runs alongside other tests on the shared cluster.
    #[default]
    Shared,
    /// Gets a dedicated cluster.
    Custom,
}

impl std::fmt::Display for SharingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for SharingMode {
    type Err = SuiteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "custom" => Ok(Self::Custom),
            _ => Err(SuiteError::Config(format!(
                "Unknown sharing mode: {s}. Supported: shared, custom"
            ))),
        }
    }
}

/// Kubernetes Job a test deploys and waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    /// Manifest file applied with kubectl.
    pub path: PathBuf,
    /// Name of the Job whose completion ends the test.
    pub job: String,
    /// Namespace of the Job.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// How long to wait for the Job.
    #[serde(default = "default_job_timeout")]
    pub timeout_secs: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_job_timeout() -> u64 {
    3600
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    /// Test name (the catalog key).
    #[serde(skip)]
    pub name: String,
    /// Whether the test runs in this invocation.
    pub run: bool,
    /// Placement of the test.
    #[serde(default)]
    pub sharing: SharingMode,
    /// Flavor override for a custom cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    /// Node count for a custom cluster (default 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,
    /// Job-based test body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestSpec>,
}

/// The full tests catalog, keyed by test name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Catalog entries.
    pub tests: BTreeMap<String, TestDefinition>,
}

impl Catalog {
    /// Parse a catalog from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or an entry is inconsistent.
    pub fn from_yaml(content: &str) -> SuiteResult<Self> {
        let mut catalog: Self = serde_yaml::from_str(content)?;
        for (name, test) in &mut catalog.tests {
            test.name.clone_from(name);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> SuiteResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SuiteError::Config(format!("Cannot read tests catalog {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> SuiteResult<()> {
        if self.tests.contains_key(SHARED_GROUP) {
            return Err(SuiteError::Config(format!(
                "'{SHARED_GROUP}' is reserved for the shared cluster and cannot name a test"
            )));
        }
        for test in self.tests.values() {
            if !is_directory_name(&test.name) {
                return Err(SuiteError::Config(format!(
                    "Test name '{}' cannot be used as a cluster directory",
                    test.name
                )));
            }
            if test.nodes == Some(0) {
                return Err(SuiteError::Config(format!(
                    "Test '{}' requests 0 nodes",
                    test.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a test by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TestDefinition> {
        self.tests.get(name)
    }

    /// Tests selected for this run, in name order.
    pub fn selected(&self) -> impl Iterator<Item = &TestDefinition> {
        self.tests.values().filter(|t| t.run)
    }

    /// Every cluster this catalog can ever provision: the shared cluster and
    /// one per custom test, selected or not.
    #[must_use]
    pub fn known_clusters(&self) -> Vec<String> {
        std::iter::once(SHARED_GROUP.to_string())
            .chain(
                self.tests
                    .values()
                    .filter(|t| t.sharing == SharingMode::Custom)
                    .map(|t| t.name.clone()),
            )
            .collect()
    }
}

/// A single path component that stays inside its parent directory.
fn is_directory_name(name: &str) -> bool {
    !name.is_empty() && name != "." && !name.contains(['/', '\\']) && !name.contains("..")
}
