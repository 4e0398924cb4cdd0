//! Ansible bootstrap adapter.
//!
//! Turns the raw VMs created by Terraform into a Kubernetes cluster: node
//! addresses come from `terraform output -json`, are written to a `hosts`
//! inventory in the cluster directory, and the bootstrap playbook is run
//! against it. The first node becomes the master.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::process::stream_command;
use crate::terraform::TerraformCli;
use crate::traits::{BootstrapReport, BootstrapRequest, BootstrapTool, ToolError};

/// Inventory file name inside a cluster directory.
pub const INVENTORY_FILE: &str = "hosts";

/// `ansible-playbook` driver.
#[derive(Debug, Clone)]
pub struct AnsibleCli {
    playbook: PathBuf,
    binary: String,
    terraform: TerraformCli,
}

impl AnsibleCli {
    /// Create a driver running the given bootstrap playbook.
    #[must_use]
    pub fn new(playbook: impl Into<PathBuf>) -> Self {
        Self {
            playbook: playbook.into(),
            binary: "ansible-playbook".to_string(),
            terraform: TerraformCli::default(),
        }
    }

    /// Use a specific terraform driver to read node addresses.
    #[must_use]
    pub fn with_terraform(mut self, terraform: TerraformCli) -> Self {
        self.terraform = terraform;
        self
    }
}

/// Extract node addresses from `terraform output -json`.
///
/// # Errors
///
/// Returns an error if the expected output is missing or empty.
pub fn node_addresses(
    outputs: &serde_json::Value,
    use_private_ips: bool,
) -> Result<Vec<String>, ToolError> {
    let key = if use_private_ips {
        "private_ips"
    } else {
        "public_ips"
    };

    let addresses: Vec<String> = outputs
        .get(key)
        .and_then(|o| o.get("value"))
        .and_then(serde_json::Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    if addresses.is_empty() {
        return Err(ToolError::Failed {
            tool: "terraform output".into(),
            message: format!("no addresses found in output '{key}'"),
        });
    }

    Ok(addresses)
}

/// Render the inventory: first address is the master, the rest are workers.
#[must_use]
pub fn render_inventory(addresses: &[String], user: &str, key_path: &Path) -> String {
    let host_line = |addr: &str| {
        format!(
            "{addr} ansible_user={user} ansible_ssh_private_key_file={}\n",
            key_path.display()
        )
    };

    let mut inventory = String::from("[master]\n");
    if let Some(master) = addresses.first() {
        inventory.push_str(&host_line(master));
    }

    inventory.push_str("\n[slaves]\n");
    for addr in addresses.iter().skip(1) {
        inventory.push_str(&host_line(addr));
    }

    inventory.push_str("\n[all:vars]\nansible_ssh_common_args='-o StrictHostKeyChecking=no'\n");
    inventory
}

#[async_trait]
impl BootstrapTool for AnsibleCli {
    async fn bootstrap(&self, req: &BootstrapRequest) -> Result<BootstrapReport, ToolError> {
        let outputs = self.terraform.outputs(&req.dir).await?;
        let addresses = node_addresses(&outputs, req.use_private_ips)?;

        let inventory_path = req.dir.join(INVENTORY_FILE);
        std::fs::write(
            &inventory_path,
            render_inventory(&addresses, &req.user, &req.key_path),
        )?;

        info!(
            group = %req.group,
            nodes = addresses.len(),
            "Bootstrapping cluster with ansible"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-i")
            .arg(&inventory_path)
            .arg(&self.playbook)
            .arg("-e")
            .arg(format!("kubeconfig_dest={}", req.kubeconfig.display()))
            .arg("-e")
            .arg(format!("provider={}", req.provider))
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .current_dir(&req.dir);

        let run = stream_command(cmd, &self.binary, &req.group, None).await?;
        if !run.status.success() {
            return Err(ToolError::Failed {
                tool: self.binary.clone(),
                message: run
                    .tail
                    .last()
                    .cloned()
                    .unwrap_or_else(|| format!("exited with {}", run.status)),
            });
        }

        if !req.kubeconfig.is_file() {
            return Err(ToolError::Failed {
                tool: self.binary.clone(),
                message: format!(
                    "playbook finished but no kubeconfig at {}",
                    req.kubeconfig.display()
                ),
            });
        }

        Ok(BootstrapReport {
            master_address: addresses[0].clone(),
        })
    }
}
