//! repack-executor - backend-agnostic job dispatch
//!
//! The engine talks to one [`Executor`]: it submits jobs and awaits
//! completions one at a time. [`LocalExecutor`] runs child processes on a
//! bounded pool; [`ClusterExecutor`] hands jobs to a [`BatchSystem`] and polls
//! for their terminal state.

pub mod backoff;
pub mod cluster;
pub mod job;
pub mod local;
pub mod lsf;

pub use backoff::{Backoff, BackoffConfig};
pub use cluster::{BatchError, BatchSystem, ClusterConfig, ClusterExecutor, RemoteJobId, RemoteState};
pub use job::{Completion, JobHandle, JobResult, JobSpec, SubmitError};
pub use local::LocalExecutor;
pub use lsf::LsfBatchSystem;

use tokio_util::sync::CancellationToken;

/// Capability interface every backend implements.
///
/// Guarantees: each accepted submission yields exactly one [`Completion`];
/// cancellation is best-effort and never un-runs side effects.
#[async_trait::async_trait]
pub trait Executor: Send {
    /// Accept a job. Backends with bounded capacity queue rather than reject.
    async fn submit(&mut self, job: JobSpec) -> Result<JobHandle, SubmitError>;

    /// Wait for the next completion. `None` once nothing is outstanding.
    ///
    /// Must be cancel-safe: dropping the future loses no completion.
    async fn next_completion(&mut self) -> Option<Completion>;

    /// Best-effort cancellation. Returns whether a cancel was issued.
    async fn cancel(&mut self, _handle: JobHandle) -> bool {
        false
    }

    /// How many jobs the backend runs at once, if bounded.
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Jobs keep running outside this process after a stop, so the engine
    /// does not wait for them.
    fn detached_on_stop(&self) -> bool {
        false
    }

    /// Run-level stop signal. Backends that wait inside `submit` give up
    /// the wait once it fires.
    fn watch_stop(&mut self, _stop: CancellationToken) {}

    /// Number of submissions without a delivered completion.
    fn outstanding(&self) -> usize;

    fn name(&self) -> &str;
}

#[async_trait::async_trait]
impl<E: Executor + ?Sized> Executor for Box<E> {
    async fn submit(&mut self, job: JobSpec) -> Result<JobHandle, SubmitError> {
        (**self).submit(job).await
    }

    async fn next_completion(&mut self) -> Option<Completion> {
        (**self).next_completion().await
    }

    async fn cancel(&mut self, handle: JobHandle) -> bool {
        (**self).cancel(handle).await
    }

    fn capacity(&self) -> Option<usize> {
        (**self).capacity()
    }

    fn detached_on_stop(&self) -> bool {
        (**self).detached_on_stop()
    }

    fn watch_stop(&mut self, stop: CancellationToken) {
        (**self).watch_stop(stop)
    }

    fn outstanding(&self) -> usize {
        (**self).outstanding()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
