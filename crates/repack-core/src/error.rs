//! Error types for repack

use crate::types::TargetId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("dependency cycle: {}", render_cycle(.cycle))]
    CycleError { cycle: Vec<TargetId> },

    #[error("state corruption in {}{}: {reason}", .path.display(), render_line(.line))]
    StateCorruptionError {
        path: PathBuf,
        line: Option<u64>,
        reason: String,
    },

    #[error("executor submission failed for {target}: {message}")]
    ExecutorSubmissionError { target: TargetId, message: String },

    #[error("executor runtime error for {target}: {message}")]
    ExecutorRuntimeError { target: TargetId, message: String },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn corruption(path: impl Into<PathBuf>, line: Option<u64>, reason: impl Into<String>) -> Self {
        Self::StateCorruptionError {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    pub fn submission(target: TargetId, message: impl Into<String>) -> Self {
        Self::ExecutorSubmissionError {
            target,
            message: message.into(),
        }
    }

    pub fn runtime(target: TargetId, message: impl Into<String>) -> Self {
        Self::ExecutorRuntimeError {
            target,
            message: message.into(),
        }
    }

    /// Startup-class errors abort a run before anything is dispatched.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_) | Self::CycleError { .. } | Self::StateCorruptionError { .. }
        )
    }
}

fn render_cycle(cycle: &[TargetId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn render_line(line: &Option<u64>) -> String {
    match line {
        Some(n) => format!(" (line {n})"),
        None => String::new(),
    }
}
