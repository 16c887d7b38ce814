//! Cluster executor: submit to a batch system, poll for terminal state.
//!
//! The batch system itself sits behind [`BatchSystem`] so the polling and
//! retry logic here is independent of LSF (see [`crate::lsf`]).

use crate::backoff::{Backoff, BackoffConfig};
use crate::job::{Completion, JobHandle, JobResult, JobSpec, SubmitError};
use crate::Executor;
use repack_core::TargetId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifier the batch system assigned at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteJobId(pub String);

impl std::fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Running,
    Done,
    /// Terminated unsuccessfully, with the exit code when the system reports one.
    Exit(Option<i32>),
    /// The system has no record of the job (yet, or any more).
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    /// Worth retrying: scheduler busy, master not responding.
    #[error("transient batch error: {0}")]
    Transient(String),

    #[error("batch error: {0}")]
    Fatal(String),
}

/// Adapter for one batch scheduler.
#[async_trait::async_trait]
pub trait BatchSystem: Send + Sync {
    async fn submit(&self, job: &JobSpec) -> Result<RemoteJobId, BatchError>;

    /// Current state of each job. Jobs missing from the map are treated as
    /// [`RemoteState::Unknown`].
    async fn query(&self, ids: &[RemoteJobId]) -> Result<HashMap<RemoteJobId, RemoteState>, BatchError>;

    async fn cancel(&self, _id: &RemoteJobId) -> Result<(), BatchError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub poll_interval: Duration,
    /// Cap on jobs handed to the scheduler at once. 0 means no cap.
    pub max_in_flight: usize,
    pub submit_attempts: u32,
    pub backoff: BackoffConfig,
    /// Consecutive polls a job may be unknown before it counts as lost.
    pub unknown_poll_limit: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_in_flight: 0,
            submit_attempts: 3,
            backoff: BackoffConfig::default(),
            unknown_poll_limit: 3,
        }
    }
}

struct Tracked {
    remote: RemoteJobId,
    target: TargetId,
    submitted: Instant,
    unknown_polls: u32,
}

pub struct ClusterExecutor {
    system: Arc<dyn BatchSystem>,
    config: ClusterConfig,
    next_handle: u64,
    in_flight: BTreeMap<JobHandle, Tracked>,
    /// Completions observed by a poll but not yet handed out.
    finished: VecDeque<Completion>,
    last_poll: Option<Instant>,
    stop: CancellationToken,
}

impl ClusterExecutor {
    pub fn new(system: Arc<dyn BatchSystem>, config: ClusterConfig) -> Self {
        Self {
            system,
            config,
            next_handle: 0,
            in_flight: BTreeMap::new(),
            finished: VecDeque::new(),
            last_poll: None,
            stop: CancellationToken::new(),
        }
    }

    /// One status query over every in-flight job.
    async fn poll(&mut self) {
        let ids: Vec<RemoteJobId> = self.in_flight.values().map(|t| t.remote.clone()).collect();
        let outcome = self.system.query(&ids).await;
        self.last_poll = Some(Instant::now());

        let states = match outcome {
            Ok(states) => states,
            Err(BatchError::Transient(msg)) => {
                warn!(system = self.system.name(), error = %msg, "status query failed, will retry");
                return;
            }
            Err(BatchError::Fatal(msg)) => {
                error!(
                    system = self.system.name(),
                    error = %msg,
                    jobs = self.in_flight.len(),
                    "status query failed, failing in-flight jobs"
                );
                let all: Vec<JobHandle> = self.in_flight.keys().copied().collect();
                for handle in all {
                    self.finish(handle, |elapsed| {
                        JobResult::abnormal(format!("status query failed: {msg}"), elapsed)
                    });
                }
                return;
            }
        };

        let limit = self.config.unknown_poll_limit.max(1);
        let mut done: Vec<(JobHandle, Result<i32, String>)> = Vec::new();
        for (handle, tracked) in self.in_flight.iter_mut() {
            match states.get(&tracked.remote).copied().unwrap_or(RemoteState::Unknown) {
                RemoteState::Pending | RemoteState::Running => tracked.unknown_polls = 0,
                RemoteState::Done => done.push((*handle, Ok(0))),
                RemoteState::Exit(Some(code)) => done.push((*handle, Ok(code))),
                RemoteState::Exit(None) => {
                    done.push((*handle, Err("job exited without an exit code".to_string())))
                }
                RemoteState::Unknown => {
                    tracked.unknown_polls += 1;
                    debug!(id = %tracked.target, remote = %tracked.remote, polls = tracked.unknown_polls, "job unknown to batch system");
                    if tracked.unknown_polls >= limit {
                        let msg = format!("job {} lost: unknown to batch system for {limit} polls", tracked.remote);
                        done.push((*handle, Err(msg)));
                    }
                }
            }
        }

        for (handle, outcome) in done {
            self.finish(handle, |elapsed| match outcome {
                Ok(code) => JobResult::exited(code, elapsed),
                Err(msg) => JobResult::abnormal(msg, elapsed),
            });
        }
    }

    fn finish(&mut self, handle: JobHandle, result: impl FnOnce(Duration) -> JobResult) {
        if let Some(tracked) = self.in_flight.remove(&handle) {
            let result = result(tracked.submitted.elapsed());
            info!(id = %tracked.target, remote = %tracked.remote, exit_code = ?result.exit_code, "remote job finished");
            self.finished.push_back(Completion { handle, result });
        }
    }
}

#[async_trait::async_trait]
impl Executor for ClusterExecutor {
    async fn submit(&mut self, job: JobSpec) -> Result<JobHandle, SubmitError> {
        let attempts = self.config.submit_attempts.max(1);
        let mut backoff = Backoff::new(&self.config.backoff);
        let mut attempt = 0;

        let remote = loop {
            attempt += 1;
            match self.system.submit(&job).await {
                Ok(remote) => break remote,
                Err(BatchError::Fatal(msg)) => return Err(SubmitError::Rejected(msg)),
                Err(BatchError::Transient(msg)) if attempt < attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        id = %job.target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "submission failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.cancelled() => {
                            debug!(id = %job.target, attempt, "stop during submission backoff");
                            return Err(SubmitError::Interrupted);
                        }
                    }
                }
                Err(BatchError::Transient(message)) => {
                    return Err(SubmitError::RetriesExhausted { attempts, message });
                }
            }
        };

        self.next_handle += 1;
        let handle = JobHandle(self.next_handle);
        info!(id = %job.target, %remote, system = self.system.name(), "submitted");
        self.in_flight.insert(
            handle,
            Tracked {
                remote,
                target: job.target,
                submitted: Instant::now(),
                unknown_polls: 0,
            },
        );
        Ok(handle)
    }

    fn watch_stop(&mut self, stop: CancellationToken) {
        self.stop = stop;
    }

    async fn next_completion(&mut self) -> Option<Completion> {
        loop {
            if let Some(c) = self.finished.pop_front() {
                return Some(c);
            }
            if self.in_flight.is_empty() {
                return None;
            }
            if let Some(last) = self.last_poll {
                tokio::time::sleep_until(last + self.config.poll_interval).await;
            }
            self.poll().await;
        }
    }

    async fn cancel(&mut self, handle: JobHandle) -> bool {
        let Some(tracked) = self.in_flight.get(&handle) else {
            return false;
        };
        match self.system.cancel(&tracked.remote).await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %tracked.target, remote = %tracked.remote, error = %e, "cancel failed");
                false
            }
        }
    }

    fn capacity(&self) -> Option<usize> {
        (self.config.max_in_flight > 0).then_some(self.config.max_in_flight)
    }

    fn detached_on_stop(&self) -> bool {
        true
    }

    fn outstanding(&self) -> usize {
        self.in_flight.len() + self.finished.len()
    }

    fn name(&self) -> &str {
        "cluster"
    }
}
