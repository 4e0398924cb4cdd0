//! Copy of run results to S3-compatible storage.

use std::path::Path;

use tokio::process::Command;
use tracing::info;

use crate::config::UploadConfig;
use crate::error::{SuiteError, SuiteResult};

/// Uploads a run directory with `aws s3 cp --recursive`.
#[derive(Debug, Clone)]
pub struct ResultUploader {
    config: UploadConfig,
    binary: String,
}

impl ResultUploader {
    #[must_use]
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            binary: "aws".to_string(),
        }
    }

    /// Use another AWS CLI executable.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Destination of a run: `<bucket>/<provider>/<timestamp>`.
    #[must_use]
    pub fn destination(&self, provider: &str, timestamp: &str) -> String {
        format!(
            "{}/{provider}/{timestamp}",
            self.config.bucket.trim_end_matches('/')
        )
    }

    fn command(&self, run_dir: &Path, destination: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["s3", "cp"])
            .arg(format!("--endpoint-url={}", self.config.endpoint))
            .arg(run_dir)
            .arg(destination)
            .arg("--recursive");
        cmd
    }

    /// Upload `run_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::UploadFailure`] if the copy cannot be started or
    /// does not succeed.
    pub async fn upload(&self, run_dir: &Path, provider: &str, timestamp: &str) -> SuiteResult<()> {
        let destination = self.destination(provider, timestamp);
        let failure = |message: String| SuiteError::UploadFailure {
            endpoint: self.config.endpoint.clone(),
            message,
        };

        info!(endpoint = %self.config.endpoint, %destination, "Uploading results");
        let run = provision::process::stream_command(
            self.command(run_dir, &destination),
            &self.binary,
            "upload",
            None,
        )
        .await
        .map_err(|e| failure(e.to_string()))?;

        if run.status.success() {
            Ok(())
        } else {
            Err(failure(
                run.tail
                    .last()
                    .cloned()
                    .unwrap_or_else(|| format!("exited with {}", run.status)),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploader() -> ResultUploader {
        ResultUploader::new(UploadConfig {
            endpoint: "https://s3.cern.ch".into(),
            bucket: "s3://ts-results/".into(),
        })
    }

    #[test]
    fn test_destination() {
        assert_eq!(
            uploader().destination("openstack", "07-03-2024_09-05-01"),
            "s3://ts-results/openstack/07-03-2024_09-05-01"
        );
    }

    #[test]
    fn test_command_line() {
        let uploader = uploader();
        let cmd = uploader.command(Path::new("results/openstack/t"), "s3://ts-results/openstack/t");
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "s3",
                "cp",
                "--endpoint-url=https://s3.cern.ch",
                "results/openstack/t",
                "s3://ts-results/openstack/t",
                "--recursive"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_upload_failure() {
        let uploader = uploader().with_binary("definitely-not-aws-cli");
        let dir = tempfile::tempdir().unwrap();

        let err = uploader.upload(dir.path(), "openstack", "t").await.unwrap_err();
        assert!(matches!(err, SuiteError::UploadFailure { ref endpoint, .. } if endpoint == "https://s3.cern.ch"));
    }
}
