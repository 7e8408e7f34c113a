//! Batch scheduler invocation.
//!
//! The scheduler's answer only says whether the job was queued. Whether the
//! analysis ran, and how it went, is learned later from the update file.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// What the scheduler needs to queue one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub job_key: i64,
    pub descriptor: PathBuf,
    /// Working directory for the submission (the job's output directory).
    pub output_dir: PathBuf,
}

/// The scheduler accepted the job. `output` is whatever it printed, usually
/// its own job identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerAck {
    pub output: String,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} exited with {code:?}: {stderr}")]
    Rejected {
        binary: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn submit(&self, request: &SubmissionRequest) -> Result<SchedulerAck, SchedulerError>;
}

/// Submits by running `<binary> <runner> <descriptor>`, `qsub`-style.
#[derive(Debug, Clone)]
pub struct CommandScheduler {
    binary: PathBuf,
    runner: PathBuf,
}

impl CommandScheduler {
    pub fn new(binary: impl Into<PathBuf>, runner: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            runner: runner.into(),
        }
    }
}

#[async_trait]
impl Scheduler for CommandScheduler {
    async fn submit(&self, request: &SubmissionRequest) -> Result<SchedulerAck, SchedulerError> {
        let binary = self.binary.display().to_string();
        debug!(
            job_key = request.job_key,
            scheduler = %binary,
            runner = %self.runner.display(),
            descriptor = %request.descriptor.display(),
            "Invoking scheduler"
        );

        let output = Command::new(&self.binary)
            .arg(&self.runner)
            .arg(&request.descriptor)
            .current_dir(&request.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| SchedulerError::Launch {
                binary: binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SchedulerError::Rejected {
                binary,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        info!(job_key = request.job_key, ack = %stdout.trim(), "Scheduler accepted job");
        Ok(SchedulerAck { output: stdout })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> SubmissionRequest {
        SubmissionRequest {
            job_key: 4,
            descriptor: dir.path().join("ENVVARS_4"),
            output_dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_accepted_submission_returns_stdout() {
        let dir = TempDir::new().unwrap();
        let scheduler = CommandScheduler::new("echo", "runMuJob.sh");

        let ack = scheduler.submit(&request(&dir)).await.unwrap();
        assert!(ack.output.starts_with("runMuJob.sh "));
        assert!(ack.output.trim_end().ends_with("ENVVARS_4"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_rejection() {
        let dir = TempDir::new().unwrap();
        let scheduler = CommandScheduler::new("false", "runMuJob.sh");

        let err = scheduler.submit(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Rejected { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let scheduler = CommandScheduler::new("/nonexistent/qsub", "runMuJob.sh");

        let err = scheduler.submit(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Launch { .. }));
    }
}
