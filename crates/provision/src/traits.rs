//! Collaborator traits and common types for infrastructure tooling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::SentinelRun;

/// Errors that can occur while driving an external tool.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The tool binary could not be started.
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error around the tool invocation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tool ran but reported failure.
    #[error("{tool} failed: {message}")]
    Failed { tool: String, message: String },

    /// Rendering input was rejected before any template was touched.
    #[error("Invalid infrastructure definition: {0}")]
    Validation(String),

    /// Template rendering failed.
    #[error("Template error: {0}")]
    Render(#[from] handlebars::RenderError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kubeconfig could not be loaded.
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Input to the templating collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Terraform provider name (e.g. `openstack`).
    pub provider_name: String,
    /// Terraform resource type for one instance (e.g. `openstack_compute_instance_v2`).
    pub provider_instance_name: String,
    /// Base name for the VMs of this cluster.
    pub node_name: String,
    /// Number of VMs to create.
    pub node_count: u32,
    /// HCL line selecting the VM flavor.
    pub flavor: String,
    /// Path to the SSH private key used to reach the VMs.
    pub key_path: String,
    /// HCL credentials block for the provider.
    pub credentials: String,
    /// HCL for infrastructure the instances depend on (networks, keypairs...).
    pub dependencies: String,
    /// HCL body of one instance.
    pub instance_definition: String,
    /// Extra HCL appended to the instance body.
    pub extra_instance_config: Option<String>,
    /// Instance attribute holding the public address.
    pub public_ip_attribute: String,
    /// Instance attribute holding the private address.
    pub private_ip_attribute: String,
    /// Provider-specific variables written to `terraform.tfvars.json`.
    pub variables: BTreeMap<String, serde_json::Value>,
}

/// A renderable infrastructure definition.
#[derive(Debug, Clone, PartialEq)]
pub struct InfraDefinition {
    /// Contents of `main.tf`.
    pub main_tf: String,
    /// Contents of `terraform.tfvars.json`.
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// Renders the provider-specific infrastructure definition for a cluster.
///
/// Implementations must be pure: same request, same definition.
pub trait Templater: Send + Sync {
    /// Render the definition or reject the request.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Validation`] when the request is incomplete.
    fn render(&self, req: &RenderRequest) -> Result<InfraDefinition, ToolError>;
}

/// Infrastructure apply/teardown tool.
///
/// Success of either verb is signalled only by [`SentinelRun::succeeded`]:
/// the tool must print the sentinel after a genuinely completed run, so a
/// zero exit code without the sentinel is still a failure.
#[async_trait]
pub trait InfraTool: Send + Sync {
    /// Create the raw compute resources described in `dir`.
    async fn apply(&self, dir: &Path, tag: &str) -> Result<SentinelRun, ToolError>;

    /// Destroy the resources tracked in `dir`.
    async fn destroy(&self, dir: &Path, tag: &str) -> Result<SentinelRun, ToolError>;
}

/// Input to the bootstrap tool.
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    /// Cluster group identifier (used to tag output).
    pub group: String,
    /// Cluster working directory holding the infrastructure state.
    pub dir: PathBuf,
    /// Where the cluster's kubeconfig must be written.
    pub kubeconfig: PathBuf,
    /// SSH private key for the VMs.
    pub key_path: PathBuf,
    /// SSH user for the VMs.
    pub user: String,
    /// Use private instead of public node addresses.
    pub use_private_ips: bool,
    /// Provider name, forwarded to the playbook.
    pub provider: String,
}

/// Result of a successful bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Address of the Kubernetes master node.
    pub master_address: String,
}

/// Configuration-management tool turning raw VMs into a cluster.
#[async_trait]
pub trait BootstrapTool: Send + Sync {
    /// Bootstrap the cluster and return its master address.
    async fn bootstrap(&self, req: &BootstrapRequest) -> Result<BootstrapReport, ToolError>;
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The default service account exists.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
}

/// Blocking readiness check against a freshly bootstrapped cluster.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Poll until the default service account exists or `timeout` elapses.
    async fn wait_ready(&self, kubeconfig: &Path, timeout: Duration)
        -> Result<Readiness, ToolError>;
}
