//! What the engine hands an executor, and what comes back.

use repack_core::{CommandSpec, KitTarget, TargetId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Everything an executor needs to run one target.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub target: TargetId,
    pub command: CommandSpec,
    pub output_path: PathBuf,
    /// Merged stdout/stderr of the job. `None` discards output.
    pub log_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn from_target(target: &KitTarget, log_path: Option<PathBuf>) -> Self {
        Self {
            target: target.id.clone(),
            command: target.command.clone(),
            output_path: target.output_path.clone(),
            log_path,
            cwd: target.cwd.clone(),
            env: target.env.clone(),
        }
    }
}

/// Executor-assigned token for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// `None` when the job never produced an exit code (signal, spawn failure, lost remote job).
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Why the job ended abnormally, if it did.
    pub error: Option<String>,
}

impl JobResult {
    pub fn exited(code: i32, duration: Duration) -> Self {
        Self {
            exit_code: Some(code),
            duration,
            error: None,
        }
    }

    pub fn abnormal(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code: None,
            duration,
            error: Some(message.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }

    /// Human-readable failure reason, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        Some(match (&self.error, self.exit_code) {
            (Some(e), _) => e.clone(),
            (None, Some(code)) => format!("exit code {code}"),
            (None, None) => "terminated without an exit code".to_string(),
        })
    }
}

/// One completion notification. Exactly one per accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub handle: JobHandle,
    pub result: JobResult,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("submission failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("executor is shut down")]
    Closed,

    /// A stop arrived before the job reached the backend.
    #[error("submission interrupted by stop")]
    Interrupted,
}
