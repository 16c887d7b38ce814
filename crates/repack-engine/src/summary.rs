//! What a run reports when it ends.

use repack_core::{Status, StatusRecord, TargetId};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Still PENDING because the run was stopped first.
    pub not_run: usize,
    /// Still RUNNING on a detached backend when the run stopped.
    pub abandoned: usize,
    /// Jobs handed to the executor during this run.
    pub dispatched: usize,
    pub failed_targets: Vec<TargetId>,
    pub skipped_targets: Vec<TargetId>,
    pub stopped: bool,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a StatusRecord>,
        dispatched: usize,
        stopped: bool,
        elapsed: Duration,
    ) -> Self {
        let mut summary = Self {
            dispatched,
            stopped,
            elapsed,
            ..Self::default()
        };
        for record in records {
            summary.total += 1;
            match record.status {
                Status::Done => summary.done += 1,
                Status::Failed => {
                    summary.failed += 1;
                    summary.failed_targets.push(record.id.clone());
                }
                Status::Skipped => {
                    summary.skipped += 1;
                    summary.skipped_targets.push(record.id.clone());
                }
                Status::Pending => summary.not_run += 1,
                Status::Running => summary.abandoned += 1,
            }
        }
        summary
    }

    /// Every target ended DONE.
    pub fn is_success(&self) -> bool {
        self.done == self.total && !self.stopped
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.is_success() {
            "succeeded"
        } else if self.stopped {
            "stopped"
        } else {
            "failed"
        };
        writeln!(
            f,
            "Run {outcome} in {:.1}s: {} targets, {} done, {} failed, {} skipped ({} dispatched)",
            self.elapsed.as_secs_f64(),
            self.total,
            self.done,
            self.failed,
            self.skipped,
            self.dispatched,
        )?;
        if self.not_run > 0 {
            writeln!(f, "  not run: {}", self.not_run)?;
        }
        if self.abandoned > 0 {
            writeln!(
                f,
                "  still running remotely: {} (reset and re-dispatched on the next run)",
                self.abandoned
            )?;
        }
        for id in &self.failed_targets {
            writeln!(f, "  FAILED  {id}")?;
        }
        for id in &self.skipped_targets {
            writeln!(f, "  SKIPPED {id}")?;
        }
        Ok(())
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
