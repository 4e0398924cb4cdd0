//! Terraform adapter.
//!
//! Apply and destroy run under the sentinel contract (see [`crate::process`]).
//! This module also owns the layout of the generated files inside a cluster
//! directory: writing them before apply and removing them after a successful
//! teardown or before a fresh provisioning.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::process::{run_with_sentinel, SentinelRun};
use crate::traits::{InfraDefinition, InfraTool, ToolError};

/// Generated HCL entry point.
pub const MAIN_FILE: &str = "main.tf";

/// Generated variables file.
pub const VARIABLES_FILE: &str = "terraform.tfvars.json";

/// Terraform state; its presence means infrastructure exists for the directory.
pub const STATE_FILE: &str = "terraform.tfstate";

/// Everything a provisioning run may leave behind in a cluster directory.
pub const GENERATED_ARTIFACTS: [&str; 8] = [
    "hosts",
    "config",
    MAIN_FILE,
    "terraform.tfvars",
    VARIABLES_FILE,
    STATE_FILE,
    "terraform.tfstate.backup",
    ".terraform",
];

/// Terraform command-line driver.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

impl TerraformCli {
    /// Create a driver for the given terraform binary.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Command chain used to create the raw VMs.
    #[must_use]
    pub fn apply_command(&self) -> String {
        let b = &self.binary;
        format!("{b} init && {b} fmt > /dev/null && {b} apply -auto-approve")
    }

    /// Command chain used to tear the VMs down.
    #[must_use]
    pub fn destroy_command(&self) -> String {
        format!("{} destroy -auto-approve", self.binary)
    }

    /// Read `terraform output -json` for a cluster directory.
    ///
    /// # Errors
    ///
    /// Returns an error if terraform fails or prints invalid JSON.
    pub async fn outputs(&self, dir: &Path) -> Result<serde_json::Value, ToolError> {
        let output = Command::new(&self.binary)
            .args(["output", "-json"])
            .current_dir(dir)
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                tool: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Failed {
                tool: format!("{} output", self.binary),
                message: stderr.trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl InfraTool for TerraformCli {
    async fn apply(&self, dir: &Path, tag: &str) -> Result<SentinelRun, ToolError> {
        info!(dir = %dir.display(), "Running terraform apply");
        run_with_sentinel(&self.apply_command(), dir, tag).await
    }

    async fn destroy(&self, dir: &Path, tag: &str) -> Result<SentinelRun, ToolError> {
        info!(dir = %dir.display(), "Running terraform destroy");
        run_with_sentinel(&self.destroy_command(), dir, tag).await
    }
}

/// Write a rendered definition into a cluster directory.
///
/// # Errors
///
/// Returns an error if the directory or files cannot be written.
pub fn write_definition(dir: &Path, definition: &InfraDefinition) -> Result<(), ToolError> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(MAIN_FILE), &definition.main_tf)?;

    let variables = serde_json::to_string_pretty(&definition.variables)?;
    std::fs::write(dir.join(VARIABLES_FILE), variables)?;

    debug!(dir = %dir.display(), "Infrastructure definition written");
    Ok(())
}

/// Remove generated artifacts from a cluster directory.
///
/// Best effort: failures are logged and skipped. Returns how many entries
/// were removed.
pub fn cleanup_artifacts(dir: &Path) -> usize {
    let mut removed = 0;

    for name in GENERATED_ARTIFACTS {
        let path = dir.join(name);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if path.is_file() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove artifact"),
        }
    }

    removed
}

/// Whether a cluster directory holds infrastructure state.
#[must_use]
pub fn has_state(dir: &Path) -> bool {
    dir.join(STATE_FILE).is_file()
}
