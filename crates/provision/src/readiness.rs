//! Cluster readiness check.
//!
//! A freshly bootstrapped cluster is usable once the `default` service
//! account exists in the `default` namespace; the token controller creates
//! it only after the control plane is fully up.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::traits::{Readiness, ReadinessProbe, ToolError};

/// Polls the Kubernetes API for the default service account.
#[derive(Debug, Clone)]
pub struct ServiceAccountProbe {
    poll_interval: Duration,
}

impl Default for ServiceAccountProbe {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl ServiceAccountProbe {
    /// Create a probe with a custom poll interval.
    #[must_use]
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    async fn service_account_exists(kubeconfig: &Path) -> Result<bool, ToolError> {
        let kc = Kubeconfig::read_from(kubeconfig)
            .map_err(|e| ToolError::Kubeconfig(format!("{}: {e}", kubeconfig.display())))?;

        let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .map_err(|e| ToolError::Kubeconfig(e.to_string()))?;

        let client = Client::try_from(config)?;
        let accounts: Api<ServiceAccount> = Api::namespaced(client, "default");

        Ok(accounts.get_opt("default").await?.is_some())
    }
}

#[async_trait]
impl ReadinessProbe for ServiceAccountProbe {
    async fn wait_ready(
        &self,
        kubeconfig: &Path,
        timeout: Duration,
    ) -> Result<Readiness, ToolError> {
        let start = Instant::now();

        info!(
            kubeconfig = %kubeconfig.display(),
            "Waiting for default service account (timeout: {}s)...",
            timeout.as_secs()
        );

        loop {
            let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
                return Ok(Readiness::TimedOut);
            };

            match tokio::time::timeout(remaining, Self::service_account_exists(kubeconfig)).await
            {
                Ok(Ok(true)) => {
                    info!("Default service account is ready");
                    return Ok(Readiness::Ready);
                }
                Ok(Ok(false)) => debug!("Service account not created yet"),
                // API not reachable yet, keep polling
                Ok(Err(e)) => debug!("Readiness check failed: {e}"),
                Err(_) => return Ok(Readiness::TimedOut),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_kubeconfig_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ServiceAccountProbe::with_poll_interval(Duration::from_millis(10));

        let readiness = probe
            .wait_ready(&dir.path().join("config"), Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(readiness, Readiness::TimedOut);
    }
}
