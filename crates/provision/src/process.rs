//! Streaming execution of external tools.
//!
//! Every line a tool prints is forwarded to the log with a `[ tag ]` prefix
//! while the tool runs, and the last few lines are kept for error messages.
//! Commands that must prove they genuinely finished are wrapped so that a
//! sentinel line is printed only when the whole command chain succeeded.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::traits::ToolError;

/// Marker printed after a command chain completed successfully.
pub const APPLY_SENTINEL: &str = "__TS_VALID_RUN__";

/// Number of trailing output lines kept for diagnostics.
const TAIL_LINES: usize = 20;

/// Outcome of a sentinel-checked tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelRun {
    /// Whether the wrapping process exited with status 0.
    pub exit_success: bool,
    /// Whether the sentinel line was observed in the output stream.
    pub sentinel_seen: bool,
    /// Last lines of output (sentinel excluded).
    pub tail: Vec<String>,
}

impl SentinelRun {
    /// The run genuinely completed. The exit code alone is not trusted.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.sentinel_seen
    }

    /// Short human-readable description of the output tail.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.tail.last() {
            Some(line) => line.clone(),
            None => "no output".to_string(),
        }
    }
}

/// Result of streaming one command to completion.
#[derive(Debug)]
pub struct StreamedRun {
    /// Exit status of the process.
    pub status: ExitStatus,
    /// Whether the requested sentinel was printed.
    pub sentinel_seen: bool,
    /// Last lines of output.
    pub tail: Vec<String>,
}

struct OutputTail<'a> {
    tag: &'a str,
    sentinel: Option<&'a str>,
    seen: bool,
    lines: VecDeque<String>,
}

impl OutputTail<'_> {
    fn record(&mut self, line: String) {
        if self.sentinel.is_some_and(|s| line.trim() == s) {
            self.seen = true;
            return;
        }
        info!("[ {} ] {line}", self.tag);
        if self.lines.len() == TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

/// Run `cmd` to completion, logging stdout and stderr line by line.
///
/// # Errors
///
/// Returns an error if the process cannot be spawned or its output cannot be read.
pub async fn stream_command(
    mut cmd: Command,
    tool: &str,
    tag: &str,
    sentinel: Option<&str>,
) -> Result<StreamedRun, ToolError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| ToolError::Failed {
        tool: tool.to_string(),
        message: "stdout not captured".into(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| ToolError::Failed {
        tool: tool.to_string(),
        message: "stderr not captured".into(),
    })?;

    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let mut tail = OutputTail {
        tag,
        sentinel,
        seen: false,
        lines: VecDeque::with_capacity(TAIL_LINES),
    };

    let (mut out_open, mut err_open) = (true, true);
    while out_open || err_open {
        tokio::select! {
            line = out.next_line(), if out_open => match line? {
                Some(line) => tail.record(line),
                None => out_open = false,
            },
            line = err.next_line(), if err_open => match line? {
                Some(line) => tail.record(line),
                None => err_open = false,
            },
        }
    }

    let status = child.wait().await?;
    debug!(tool, tag, ?status, sentinel_seen = tail.seen, "Tool exited");

    Ok(StreamedRun {
        status,
        sentinel_seen: tail.seen,
        tail: tail.lines.into_iter().collect(),
    })
}

/// Wrap a shell command chain so the sentinel is printed only if it all succeeded.
#[must_use]
pub fn sentinel_script(command: &str) -> String {
    format!("({command}) && echo {APPLY_SENTINEL}")
}

/// Run a shell command chain in `dir` under the sentinel contract.
///
/// # Errors
///
/// Returns an error if the shell cannot be started or its output cannot be read.
pub async fn run_with_sentinel(
    command: &str,
    dir: &Path,
    tag: &str,
) -> Result<SentinelRun, ToolError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(sentinel_script(command)).current_dir(dir);

    let run = stream_command(cmd, "sh", tag, Some(APPLY_SENTINEL)).await?;
    Ok(SentinelRun {
        exit_success: run.status.success(),
        sentinel_seen: run.sentinel_seen,
        tail: run.tail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_script_chains_marker() {
        let script = sentinel_script("terraform apply -auto-approve");
        assert_eq!(
            script,
            format!("(terraform apply -auto-approve) && echo {APPLY_SENTINEL}")
        );
    }

    #[tokio::test]
    async fn test_successful_chain_prints_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_with_sentinel("echo applying && echo done", dir.path(), "shared")
            .await
            .unwrap();

        assert!(run.succeeded());
        assert!(run.exit_success);
        assert_eq!(run.tail, vec!["applying".to_string(), "done".to_string()]);
        assert_eq!(run.summary(), "done");
    }

    #[tokio::test]
    async fn test_failed_chain_has_no_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_with_sentinel("echo oops >&2 && false", dir.path(), "dlTest")
            .await
            .unwrap();

        assert!(!run.succeeded());
        assert!(!run.exit_success);
        assert_eq!(run.tail, vec!["oops".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_exit_without_sentinel_is_not_success() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo finished");

        let run = stream_command(cmd, "sh", "shared", Some(APPLY_SENTINEL))
            .await
            .unwrap();

        assert!(run.status.success());
        assert!(!run.sentinel_seen);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-tool-xyz");
        let err = stream_command(cmd, "xyz", "shared", None).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
