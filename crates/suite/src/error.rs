//! Error types for the validation run.
//!
//! Worker-level failures (`ProvisioningFailure`, `BootstrapFailure`,
//! `ServiceAccountTimeout`) never escape a worker: they are rendered into the
//! worker's report message. Pre-flight failures abort the run before any
//! worker starts. Post-run failures (`UploadFailure`, `TeardownFailure`) are
//! reported to the operator without touching the persisted results.

use thiserror::Error;

use crate::pipeline::ProvisionStage;

/// Errors that can occur while orchestrating a validation run.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// Retry mode requested for groups that have no infrastructure on disk.
    #[error("Retry requested but no infrastructure state found for: {}", .groups.join(", "))]
    RetryStateMissing { groups: Vec<String> },

    /// A provisioning stage failed.
    #[error("Provisioning failed at stage '{stage}': {message}")]
    ProvisioningFailure {
        stage: ProvisionStage,
        message: String,
    },

    /// The bootstrap tool could not turn the VMs into a cluster.
    #[error("Failed to bootstrap '{group}' k8s cluster: {message}")]
    BootstrapFailure { group: String, message: String },

    /// The cluster never became usable.
    #[error("Timed out waiting for {group} cluster's service account")]
    ServiceAccountTimeout { group: String },

    /// Results could not be copied to remote storage.
    #[error("Upload to {endpoint} failed: {message}")]
    UploadFailure { endpoint: String, message: String },

    /// Infrastructure teardown did not complete; artifacts were kept.
    #[error("Destroy of '{cluster}' did not succeed, tf files not deleted: {message}")]
    TeardownFailure { cluster: String, message: String },

    /// Selected tests with no handler behind them.
    #[error("No handler registered for tests: {}", .0.join(", "))]
    UnregisteredTests(Vec<String>),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for suite operations.
pub type SuiteResult<T> = Result<T, SuiteError>;
