//! Infrastructure tooling adapters for the cloud validation test suite.
//!
//! This crate wraps the external tools a validation run drives for each
//! cluster group:
//! - Terraform, to create and destroy raw VMs (sentinel-checked)
//! - Ansible, to turn raw VMs into a Kubernetes cluster
//! - the Kubernetes API, to wait for the cluster's default service account
//! - Handlebars, to render the provider-specific HCL definition
//!
//! Every tool sits behind a trait so the orchestrator can be exercised
//! without touching a real cloud.
//!
//! # Example
//!
//! ```rust,ignore
//! use provision::{InfraTool, TerraformCli};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let terraform = TerraformCli::default();
//!     let run = terraform.apply("infra/shared".as_ref(), "shared").await?;
//!     if !run.succeeded() {
//!         anyhow::bail!("apply did not complete");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ansible;
pub mod process;
pub mod readiness;
pub mod template;
pub mod terraform;
pub mod traits;

pub use ansible::AnsibleCli;
pub use process::{SentinelRun, APPLY_SENTINEL};
pub use readiness::ServiceAccountProbe;
pub use template::HclTemplater;
pub use terraform::{cleanup_artifacts, has_state, TerraformCli};
pub use traits::{
    BootstrapReport, BootstrapRequest, BootstrapTool, InfraDefinition, InfraTool, Readiness,
    ReadinessProbe, RenderRequest, Templater, ToolError,
};
