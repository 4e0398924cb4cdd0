//! Per-cluster provisioning state machine.
//!
//! `Init → CleanupPrevious → RenderConfig → ApplyInfra → Bootstrap →
//! AwaitReady → Ready`. Any stage may fail; the first failure ends the
//! pipeline and is reported in the [`ProvisioningOutcome`]. In retry mode the
//! pipeline starts at `Bootstrap` and reuses the on-disk state.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use provision::{
    AnsibleCli, BootstrapRequest, BootstrapTool, HclTemplater, InfraTool, Readiness,
    ReadinessProbe, RenderRequest, ServiceAccountProbe, Templater, TerraformCli,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, RunConfig};
use crate::error::SuiteError;
use crate::retry::GateDecision;
use crate::scheduler::ClusterGroup;

/// Provisioning stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    /// Preparing the cluster directory.
    Init,
    /// Removing artifacts of a previous run.
    CleanupPrevious,
    /// Rendering the infrastructure definition.
    RenderConfig,
    /// Creating the raw VMs.
    ApplyInfra,
    /// Turning the VMs into a Kubernetes cluster.
    Bootstrap,
    /// Waiting for the default service account.
    AwaitReady,
    /// Cluster usable by tests.
    Ready,
}

impl ProvisionStage {
    /// Total number of stages before `Ready`.
    pub const TOTAL_STEPS: u8 = 6;

    /// Get the next stage in the sequence.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Init => Self::CleanupPrevious,
            Self::CleanupPrevious => Self::RenderConfig,
            Self::RenderConfig => Self::ApplyInfra,
            Self::ApplyInfra => Self::Bootstrap,
            Self::Bootstrap => Self::AwaitReady,
            Self::AwaitReady | Self::Ready => Self::Ready,
        }
    }

    /// Get a human-readable description of the stage.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Init => "Preparing cluster directory",
            Self::CleanupPrevious => "Cleaning previous artifacts",
            Self::RenderConfig => "Rendering infrastructure definition",
            Self::ApplyInfra => "Creating raw VMs",
            Self::Bootstrap => "Bootstrapping Kubernetes cluster",
            Self::AwaitReady => "Waiting for service account",
            Self::Ready => "Cluster ready",
        }
    }

    /// 1-based position of the stage.
    #[must_use]
    pub fn step_number(self) -> u8 {
        match self {
            Self::Init => 1,
            Self::CleanupPrevious => 2,
            Self::RenderConfig => 3,
            Self::ApplyInfra => 4,
            Self::Bootstrap => 5,
            Self::AwaitReady => 6,
            Self::Ready => Self::TOTAL_STEPS,
        }
    }

    /// First stage for a gate decision, if the pipeline runs at all.
    #[must_use]
    pub fn entry_for(decision: GateDecision) -> Option<Self> {
        match decision {
            GateDecision::CleanAndProvision => Some(Self::Init),
            GateDecision::ReuseExisting => Some(Self::Bootstrap),
            GateDecision::SkipProvisioning => None,
        }
    }
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::CleanupPrevious => "CLEANUP_PREVIOUS",
            Self::RenderConfig => "RENDER_CONFIG",
            Self::ApplyInfra => "APPLY_INFRA",
            Self::Bootstrap => "BOOTSTRAP",
            Self::AwaitReady => "AWAIT_READY",
            Self::Ready => "READY",
        };
        write!(f, "{name}")
    }
}

/// Terminal result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningOutcome {
    pub success: bool,
    pub message: String,
    /// Present only on success.
    pub master_address: Option<String>,
    /// `Ready` on success, otherwise the stage that failed.
    pub stage: ProvisionStage,
}

impl ProvisioningOutcome {
    fn ready(group: &str, master_address: String) -> Self {
        Self {
            success: true,
            message: format!("{group} cluster ready, master at {master_address}"),
            master_address: Some(master_address),
            stage: ProvisionStage::Ready,
        }
    }

    fn failed(stage: ProvisionStage, error: &SuiteError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            master_address: None,
            stage,
        }
    }
}

/// External collaborators used by the pipeline and the destroy scheduler.
#[derive(Clone)]
pub struct Toolchain {
    pub templater: Arc<dyn Templater>,
    pub infra: Arc<dyn InfraTool>,
    pub bootstrap: Arc<dyn BootstrapTool>,
    pub readiness: Arc<dyn ReadinessProbe>,
}

impl Toolchain {
    /// Terraform, Ansible and the Kubernetes API.
    #[must_use]
    pub fn production(provider: &ProviderConfig) -> Self {
        Self {
            templater: Arc::new(HclTemplater::default()),
            infra: Arc::new(TerraformCli::default()),
            bootstrap: Arc::new(AnsibleCli::new(&provider.playbook)),
            readiness: Arc::new(ServiceAccountProbe::default()),
        }
    }
}

/// Moment a group's VMs started accruing cost.
///
/// Clones share the same instant, so the owner can still read it after the
/// pipeline holding a clone is gone.
#[derive(Debug, Clone, Default)]
pub struct BillableClock(Arc<OnceLock<Instant>>);

impl BillableClock {
    /// Start the clock; later calls keep the first instant.
    pub fn start(&self) {
        self.0.get_or_init(Instant::now);
    }

    #[must_use]
    pub fn since(&self) -> Option<Instant> {
        self.0.get().copied()
    }
}

/// Drives one cluster group through the provisioning stages.
pub struct ProvisioningPipeline<'a> {
    config: &'a RunConfig,
    tools: &'a Toolchain,
    group: &'a ClusterGroup,
    billable: BillableClock,
    master_address: Option<String>,
}

impl<'a> ProvisioningPipeline<'a> {
    #[must_use]
    pub fn new(config: &'a RunConfig, tools: &'a Toolchain, group: &'a ClusterGroup) -> Self {
        Self {
            config,
            tools,
            group,
            billable: BillableClock::default(),
            master_address: None,
        }
    }

    /// Record billing on `clock` instead of a private one.
    #[must_use]
    pub fn with_clock(mut self, clock: BillableClock) -> Self {
        self.billable = clock;
        self
    }

    /// When VMs started accruing cost: the start of `ApplyInfra`, or of
    /// `Bootstrap` when resuming. `None` if neither was reached.
    #[must_use]
    pub fn billable_since(&self) -> Option<Instant> {
        self.billable.since()
    }

    fn dir(&self) -> PathBuf {
        self.config.cluster_dir(&self.group.id)
    }

    /// Run from `entry` to `Ready` or the first failure.
    pub async fn run(&mut self, entry: ProvisionStage) -> ProvisioningOutcome {
        let mut stage = entry;

        while stage != ProvisionStage::Ready {
            info!(
                group = %self.group.id,
                stage = %stage,
                "[{}/{}] {}",
                stage.step_number(),
                ProvisionStage::TOTAL_STEPS,
                stage.description()
            );

            if let Err(e) = self.execute(stage).await {
                warn!(group = %self.group.id, stage = %stage, error = %e, "Provisioning failed");
                return ProvisioningOutcome::failed(stage, &e);
            }
            stage = stage.next();
        }

        match self.master_address.take() {
            Some(master) => ProvisioningOutcome::ready(&self.group.id, master),
            None => ProvisioningOutcome::failed(
                ProvisionStage::Bootstrap,
                &SuiteError::BootstrapFailure {
                    group: self.group.id.clone(),
                    message: "no master address reported".into(),
                },
            ),
        }
    }

    async fn execute(&mut self, stage: ProvisionStage) -> Result<(), SuiteError> {
        match stage {
            ProvisionStage::Init => {
                std::fs::create_dir_all(self.dir()).map_err(|e| failure(stage, e))?;
            }
            ProvisionStage::CleanupPrevious => {
                let removed = provision::cleanup_artifacts(&self.dir());
                debug!(group = %self.group.id, removed, "Previous artifacts removed");
            }
            ProvisionStage::RenderConfig => {
                let definition = self
                    .tools
                    .templater
                    .render(&self.render_request())
                    .map_err(|e| failure(stage, e))?;
                provision::terraform::write_definition(&self.dir(), &definition)
                    .map_err(|e| failure(stage, e))?;
            }
            ProvisionStage::ApplyInfra => {
                self.billable.start();
                let run = self
                    .tools
                    .infra
                    .apply(&self.dir(), &self.group.id)
                    .await
                    .map_err(|e| failure(stage, e))?;
                if !run.succeeded() {
                    return Err(failure(
                        stage,
                        format!("apply did not complete: {}", run.summary()),
                    ));
                }
            }
            ProvisionStage::Bootstrap => {
                self.billable.start();
                let report = self
                    .tools
                    .bootstrap
                    .bootstrap(&self.bootstrap_request())
                    .await
                    .map_err(|e| SuiteError::BootstrapFailure {
                        group: self.group.id.clone(),
                        message: e.to_string(),
                    })?;
                self.master_address = Some(report.master_address);
            }
            ProvisionStage::AwaitReady => {
                let readiness = self
                    .tools
                    .readiness
                    .wait_ready(
                        &self.config.kubeconfig_path(&self.group.id),
                        self.config.service_account_timeout(),
                    )
                    .await
                    .map_err(|e| failure(stage, e))?;
                if readiness == Readiness::TimedOut {
                    return Err(SuiteError::ServiceAccountTimeout {
                        group: self.group.id.clone(),
                    });
                }
            }
            ProvisionStage::Ready => {}
        }
        Ok(())
    }

    fn render_request(&self) -> RenderRequest {
        let provider = &self.config.provider;
        RenderRequest {
            provider_name: provider.provider_name.clone(),
            provider_instance_name: provider.provider_instance_name.clone(),
            node_name: provision::template::node_name(&self.group.id),
            node_count: self.group.nodes,
            flavor: provider.flavor_line(self.config.flavor_for(self.group)),
            key_path: provider.path_to_key.display().to_string(),
            credentials: provider.credentials.clone(),
            dependencies: provider.dependencies.clone(),
            instance_definition: provider.instance_definition.clone(),
            extra_instance_config: provider.extra_instance_config.clone(),
            public_ip_attribute: provider.public_ip_attribute.clone(),
            private_ip_attribute: provider.private_ip_attribute.clone(),
            variables: provider.terraform_variables.clone(),
        }
    }

    fn bootstrap_request(&self) -> BootstrapRequest {
        let provider = &self.config.provider;
        BootstrapRequest {
            group: self.group.id.clone(),
            dir: self.dir(),
            kubeconfig: self.config.kubeconfig_path(&self.group.id),
            key_path: provider.path_to_key.clone(),
            user: provider.open_user.clone(),
            use_private_ips: self.config.flags.use_private_ips,
            provider: provider.provider_name.clone(),
        }
    }
}

fn failure(stage: ProvisionStage, message: impl std::fmt::Display) -> SuiteError {
    SuiteError::ProvisioningFailure {
        stage,
        message: message.to_string(),
    }
}
