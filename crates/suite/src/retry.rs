//! Retry pre-flight and per-group provisioning gate.

use tracing::{debug, info};

use crate::config::RunConfig;
use crate::error::{SuiteError, SuiteResult};
use crate::scheduler::ClusterGroup;

/// What a worker does before its pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Wipe generated artifacts and provision from scratch.
    CleanAndProvision,
    /// Keep on-disk infrastructure and resume at bootstrap.
    ReuseExisting,
    /// Use the existing cluster as is.
    SkipProvisioning,
}

/// Decides whether groups reuse existing infrastructure.
pub struct RetryCleanupManager<'a> {
    config: &'a RunConfig,
}

impl<'a> RetryCleanupManager<'a> {
    #[must_use]
    pub fn new(config: &'a RunConfig) -> Self {
        Self { config }
    }

    /// Verify that every group can resume at bootstrap.
    ///
    /// Only meaningful in retry mode; otherwise always succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::RetryStateMissing`] naming every group whose
    /// directory has no infrastructure state.
    pub fn preflight(&self, groups: &[ClusterGroup]) -> SuiteResult<()> {
        if !self.config.flags.retry {
            return Ok(());
        }

        let missing: Vec<String> = groups
            .iter()
            .filter(|g| !provision::has_state(&self.config.cluster_dir(&g.id)))
            .map(|g| g.id.clone())
            .collect();

        if missing.is_empty() {
            info!(groups = groups.len(), "Retry state found for every group");
            Ok(())
        } else {
            Err(SuiteError::RetryStateMissing { groups: missing })
        }
    }

    /// Gate for one group.
    #[must_use]
    pub fn gate(&self, group: &ClusterGroup) -> GateDecision {
        let decision = if self.config.flags.only_test {
            GateDecision::SkipProvisioning
        } else if self.config.flags.retry {
            GateDecision::ReuseExisting
        } else {
            GateDecision::CleanAndProvision
        };
        debug!(group = %group.id, ?decision, "Provisioning gate");
        decision
    }
}
