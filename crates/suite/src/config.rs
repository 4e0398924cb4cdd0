//! Run configuration.
//!
//! Everything a run needs is gathered once at startup into a [`RunConfig`]
//! and shared read-only with every component and worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{SuiteError, SuiteResult};
use crate::scheduler::ClusterGroup;

/// Object storage destination for run results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    /// S3-compatible endpoint URL.
    pub endpoint: String,
    /// Bucket URL, e.g. `s3://ts-results`.
    pub bucket: String,
}

/// Provider configuration (`configs.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    // Provider identity
    /// Terraform provider name (e.g. `openstack`, `google`).
    pub provider_name: String,
    /// Terraform resource type for one VM.
    #[serde(default)]
    pub provider_instance_name: String,

    // Access
    /// SSH private key used to reach the VMs.
    pub path_to_key: PathBuf,
    /// SSH user on the VMs.
    #[serde(default = "default_open_user")]
    pub open_user: String,
    /// HCL credentials block. Never written to run artifacts.
    #[serde(default, skip_serializing)]
    pub credentials: String,

    // Instances
    /// Default VM flavor.
    pub flavor: String,
    /// HCL attribute selecting the flavor inside an instance block.
    #[serde(default = "default_flavor_attribute")]
    pub flavor_attribute: String,
    /// HCL for infrastructure the instances depend on.
    #[serde(default)]
    pub dependencies: String,
    /// HCL body of one instance.
    #[serde(default)]
    pub instance_definition: String,
    /// Extra HCL appended to every instance.
    #[serde(default)]
    pub extra_instance_config: Option<String>,
    /// Instance attribute holding the public address.
    #[serde(default = "default_public_ip_attribute")]
    pub public_ip_attribute: String,
    /// Instance attribute holding the private address.
    #[serde(default = "default_private_ip_attribute")]
    pub private_ip_attribute: String,
    /// Extra variables written to `terraform.tfvars.json`.
    #[serde(default)]
    pub terraform_variables: BTreeMap<String, serde_json::Value>,

    // Bootstrap
    /// Ansible playbook that builds the Kubernetes cluster.
    #[serde(default = "default_playbook")]
    pub playbook: PathBuf,
    /// How long to wait for the default service account.
    #[serde(default = "default_service_account_timeout")]
    pub service_account_timeout_secs: u64,

    // Costs and results
    /// Hourly price per VM, keyed by flavor.
    #[serde(default)]
    pub costs: BTreeMap<String, f64>,
    /// Optional remote copy of the results.
    #[serde(default)]
    pub upload: Option<UploadConfig>,

    /// Remaining keys, kept for the run artifact.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_open_user() -> String {
    "root".to_string()
}

fn default_flavor_attribute() -> String {
    "flavor_name".to_string()
}

fn default_public_ip_attribute() -> String {
    "access_ip_v4".to_string()
}

fn default_private_ip_attribute() -> String {
    "access_ip_v4".to_string()
}

fn default_playbook() -> PathBuf {
    PathBuf::from("provisionment/playbooks/bootstrap.yaml")
}

fn default_service_account_timeout() -> u64 {
    600
}

impl ProviderConfig {
    /// Parse provider configuration from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or a value is invalid.
    pub fn from_yaml(content: &str) -> SuiteResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `configs.yaml` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> SuiteResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SuiteError::Config(format!("Cannot read configs {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> SuiteResult<()> {
        if self.provider_name.trim().is_empty() {
            return Err(SuiteError::Config("providerName is empty".into()));
        }
        if self.flavor.trim().is_empty() {
            return Err(SuiteError::Config("flavor is empty".into()));
        }
        if self.path_to_key.as_os_str().is_empty() {
            return Err(SuiteError::Config("pathToKey is empty".into()));
        }
        if let Some((flavor, rate)) = self.costs.iter().find(|(_, r)| !(**r >= 0.0)) {
            return Err(SuiteError::Config(format!(
                "cost for flavor '{flavor}' must be a non-negative number, got {rate}"
            )));
        }
        Ok(())
    }

    /// HCL line selecting `flavor`.
    #[must_use]
    pub fn flavor_line(&self, flavor: &str) -> String {
        format!("{} = \"{flavor}\"", self.flavor_attribute)
    }

    /// Configuration snapshot for the run artifact (credentials excluded).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn snapshot(&self) -> SuiteResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Operator switches for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct RunFlags {
    /// Prompt before destructive actions.
    pub interactive: bool,
    /// Skip provisioning; run tests on existing clusters.
    pub only_test: bool,
    /// Reuse existing infrastructure and resume at bootstrap.
    pub retry: bool,
    /// Bootstrap over private node addresses.
    pub use_private_ips: bool,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            interactive: true,
            only_test: false,
            retry: false,
            use_private_ips: false,
        }
    }
}

/// Immutable configuration snapshot shared by every component of a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Provider configuration.
    pub provider: ProviderConfig,
    /// Tests catalog.
    pub catalog: Catalog,
    /// Operator switches.
    pub flags: RunFlags,
    /// Node count for the shared cluster, overriding the member count.
    pub custom_nodes: Option<u32>,
    /// Root of the per-cluster working directories.
    pub infra_root: PathBuf,
    /// Root of the results tree.
    pub results_root: PathBuf,
}

impl RunConfig {
    /// Assemble and validate a run configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the combination of settings is invalid.
    pub fn new(
        provider: ProviderConfig,
        catalog: Catalog,
        flags: RunFlags,
        custom_nodes: Option<u32>,
        infra_root: impl Into<PathBuf>,
        results_root: impl Into<PathBuf>,
    ) -> SuiteResult<Self> {
        if custom_nodes == Some(0) {
            return Err(SuiteError::Config("--custom-nodes must be at least 1".into()));
        }
        if flags.retry && flags.only_test {
            return Err(SuiteError::Config(
                "--retry and --only-test cannot be combined".into(),
            ));
        }

        Ok(Self {
            provider,
            catalog,
            flags,
            custom_nodes,
            infra_root: infra_root.into(),
            results_root: results_root.into(),
        })
    }

    /// Working directory of a cluster group.
    #[must_use]
    pub fn cluster_dir(&self, group: &str) -> PathBuf {
        self.infra_root.join(group)
    }

    /// Kubeconfig of a cluster group.
    #[must_use]
    pub fn kubeconfig_path(&self, group: &str) -> PathBuf {
        self.cluster_dir(group).join("config")
    }

    /// Flavor a group's VMs are created with.
    #[must_use]
    pub fn flavor_for<'a>(&'a self, group: &'a ClusterGroup) -> &'a str {
        group.flavor.as_deref().unwrap_or(&self.provider.flavor)
    }

    /// Readiness timeout.
    #[must_use]
    pub fn service_account_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.service_account_timeout_secs)
    }
}
