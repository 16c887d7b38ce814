//! Engine behaviour driven by a scripted executor

use repack_core::*;
use repack_engine::{Engine, RunSummary};
use repack_executor::{Completion, Executor, JobHandle, JobResult, JobSpec, SubmitError};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::result::Result;

// ===========================================================================
// Scripted executor
// ===========================================================================

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Exit(i32),
    Reject,
    /// Never completes on its own; only a cancel ends it.
    Hang,
}

/// Completes jobs instantly according to a per-target script (default: exit 0).
#[derive(Default)]
struct Scripted {
    outcomes: HashMap<String, Outcome>,
    ready: VecDeque<Completion>,
    hanging: Vec<JobHandle>,
    /// Deliver the most recent completion first.
    lifo: bool,
    capacity: Option<usize>,
    detached: bool,
    next: u64,
    jobs: Vec<JobSpec>,
    cancelled: Vec<JobHandle>,
    max_outstanding: usize,
}

impl Scripted {
    fn with(mut self, target: &str, outcome: Outcome) -> Self {
        self.outcomes.insert(target.to_string(), outcome);
        self
    }

    fn submitted(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.target.to_string()).collect()
    }
}

#[async_trait::async_trait]
impl Executor for Scripted {
    async fn submit(&mut self, job: JobSpec) -> Result<JobHandle, SubmitError> {
        let outcome = self
            .outcomes
            .get(&job.target.to_string())
            .copied()
            .unwrap_or(Outcome::Exit(0));
        if let Outcome::Reject = outcome {
            return Err(SubmitError::RetriesExhausted {
                attempts: 3,
                message: "queue temporarily unavailable".into(),
            });
        }
        self.next += 1;
        let handle = JobHandle(self.next);
        self.jobs.push(job);
        match outcome {
            Outcome::Exit(code) => self.ready.push_back(Completion {
                handle,
                result: JobResult::exited(code, Duration::from_millis(1)),
            }),
            _ => self.hanging.push(handle),
        }
        self.max_outstanding = self.max_outstanding.max(self.outstanding());
        Ok(handle)
    }

    async fn next_completion(&mut self) -> Option<Completion> {
        let next = if self.lifo {
            self.ready.pop_back()
        } else {
            self.ready.pop_front()
        };
        if next.is_some() {
            return next;
        }
        if !self.hanging.is_empty() {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn cancel(&mut self, handle: JobHandle) -> bool {
        let Some(pos) = self.hanging.iter().position(|h| *h == handle) else {
            return false;
        };
        self.hanging.remove(pos);
        self.cancelled.push(handle);
        self.ready.push_back(Completion {
            handle,
            result: JobResult::abnormal("terminated by stop request", Duration::ZERO),
        });
        true
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn detached_on_stop(&self) -> bool {
        self.detached
    }

    fn outstanding(&self) -> usize {
        self.ready.len() + self.hanging.len()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ===========================================================================
// Helpers
// ===========================================================================

fn target(kit: &str, name: &str) -> KitTarget {
    KitTarget::new(kit, name, CommandSpec::shell("true"), format!("out/{name}"))
}

fn id(kit: &str, name: &str) -> TargetId {
    TargetId::new(kit, name)
}

/// K::a -> K::b -> K::c, plus an independent K::d.
fn chain_kits() -> Vec<Kit> {
    vec![Kit::new("K")
        .with_target(target("K", "a"))
        .with_target(target("K", "b").after(id("K", "a")))
        .with_target(target("K", "c").after(id("K", "b")))
        .with_target(target("K", "d"))]
}

fn request(dir: &Path, kits: Vec<Kit>) -> RepackRequest {
    RepackRequest::new(kits, RunConfig::new(dir.join("repack_status.csv")))
}

fn ledger_path(dir: &Path) -> PathBuf {
    dir.join("repack_status.csv")
}

fn statuses(dir: &Path) -> HashMap<String, Status> {
    StatusLedger::load(&ledger_path(dir))
        .unwrap()
        .into_iter()
        .map(|(id, rec)| (id.to_string(), rec.status))
        .collect()
}

fn write_ledger(dir: &Path, rows: &[(&str, Status)]) {
    let records: Vec<StatusRecord> = rows
        .iter()
        .map(|(t, status)| {
            let mut r = StatusRecord::pending(id("K", t), format!("out/{t}"));
            r.status = *status;
            r
        })
        .collect();
    let last = records[records.len() - 1].clone();
    StatusLedger::new(ledger_path(dir), records).upsert(last).unwrap();
}

async fn run(req: &RepackRequest, exec: Scripted) -> (RunSummary, Scripted) {
    let mut engine = Engine::new(req, exec).unwrap();
    let summary = engine.run().await.unwrap();
    (summary, engine.into_executor())
}

// ===========================================================================
// Outcomes
// ===========================================================================

#[tokio::test]
async fn all_targets_done_is_success() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    let (summary, exec) = run(&req, Scripted::default()).await;

    assert!(summary.is_success());
    assert_eq!(summary.done, 4);
    assert_eq!(summary.dispatched, 4);
    assert_eq!(exec.submitted(), vec!["K::a", "K::d", "K::b", "K::c"]);
    assert!(statuses(dir.path()).values().all(|s| *s == Status::Done));
}

#[tokio::test]
async fn failure_is_isolated_to_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    let exec = Scripted::default().with("K::a", Outcome::Exit(1));
    let (summary, exec) = run(&req, exec).await;

    let s = statuses(dir.path());
    assert_eq!(s["K::a"], Status::Failed);
    assert_eq!(s["K::b"], Status::Skipped);
    assert_eq!(s["K::c"], Status::Skipped);
    assert_eq!(s["K::d"], Status::Done);

    assert_eq!(summary.failed_targets, vec![id("K", "a")]);
    assert_eq!(summary.skipped_targets, vec![id("K", "b"), id("K", "c")]);
    assert_eq!(summary.exit_code(), 1);
    assert!(!exec.submitted().contains(&"K::b".to_string()));
}

#[tokio::test]
async fn failed_exit_code_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    run(&req, Scripted::default().with("K::d", Outcome::Exit(42))).await;

    let records = StatusLedger::load(&ledger_path(dir.path())).unwrap();
    let d = &records[&id("K", "d")];
    assert_eq!(d.exit_code, Some(42));
    assert!(d.started_at.is_some());
    assert!(d.finished_at >= d.started_at);
}

#[tokio::test]
async fn rejected_submission_fails_target_and_skips_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    let exec = Scripted::default().with("K::a", Outcome::Reject);
    let (summary, _) = run(&req, exec).await;

    let records = StatusLedger::load(&ledger_path(dir.path())).unwrap();
    assert_eq!(records[&id("K", "a")].status, Status::Failed);
    assert_eq!(records[&id("K", "a")].exit_code, None);
    assert_eq!(records[&id("K", "b")].status, Status::Skipped);
    assert_eq!(records[&id("K", "d")].status, Status::Done);
    assert_eq!(summary.dispatched, 1);
}

#[tokio::test]
async fn kit_dependency_waits_for_every_target() {
    let dir = tempfile::tempdir().unwrap();
    let kits = vec![
        Kit::new("K1")
            .with_target(target("K1", "a1"))
            .with_target(target("K1", "a2"))
            .with_target(target("K1", "a3")),
        Kit::new("K2").with_target(target("K2", "b")).depends_on("K1"),
    ];
    let req = request(dir.path(), kits);
    let exec = Scripted {
        lifo: true,
        ..Scripted::default()
    };
    let (summary, exec) = run(&req, exec).await;

    assert!(summary.is_success());
    assert_eq!(exec.submitted().last().map(String::as_str), Some("K2::b"));
}

#[tokio::test]
async fn dispatch_respects_executor_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let kit = (0..5).fold(Kit::new("K"), |k, i| k.with_target(target("K", &format!("t{i}"))));
    let req = request(dir.path(), vec![kit]);
    let exec = Scripted {
        capacity: Some(2),
        ..Scripted::default()
    };
    let (summary, exec) = run(&req, exec).await;

    assert_eq!(summary.done, 5);
    assert!(exec.max_outstanding <= 2, "{} jobs outstanding", exec.max_outstanding);
}

#[tokio::test]
async fn jobs_carry_per_target_log_path() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    let (_, exec) = run(&req, Scripted::default()).await;
    assert_eq!(
        exec.jobs[0].log_path.as_deref(),
        Some(dir.path().join("logs").join("K__a.log").as_path())
    );
}

// ===========================================================================
// Resume
// ===========================================================================

#[tokio::test]
async fn second_run_over_done_ledger_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    run(&req, Scripted::default()).await;
    let before = std::fs::read(ledger_path(dir.path())).unwrap();

    let (summary, exec) = run(&req, Scripted::default()).await;
    assert!(exec.submitted().is_empty());
    assert_eq!(summary.dispatched, 0);
    assert!(summary.is_success());
    assert_eq!(std::fs::read(ledger_path(dir.path())).unwrap(), before);
}

#[tokio::test]
async fn interrupted_target_is_reset_and_redispatched() {
    let dir = tempfile::tempdir().unwrap();
    write_ledger(
        dir.path(),
        &[
            ("a", Status::Done),
            ("b", Status::Running),
            ("c", Status::Pending),
            ("d", Status::Done),
        ],
    );
    let req = request(dir.path(), chain_kits());
    let (summary, exec) = run(&req, Scripted::default()).await;

    assert_eq!(exec.submitted(), vec!["K::b", "K::c"]);
    assert!(summary.is_success());
}

#[tokio::test]
async fn failed_and_skipped_targets_run_again() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    run(&req, Scripted::default().with("K::a", Outcome::Exit(1))).await;

    let (summary, exec) = run(&req, Scripted::default()).await;
    assert_eq!(exec.submitted(), vec!["K::a", "K::b", "K::c"]);
    assert!(summary.is_success());
}

#[tokio::test]
async fn force_redispatches_done_targets() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path(), chain_kits());
    run(&req, Scripted::default()).await;

    req.config.force = true;
    let (summary, _) = run(&req, Scripted::default()).await;
    assert_eq!(summary.dispatched, 4);
}

// ===========================================================================
// Startup errors
// ===========================================================================

#[tokio::test]
async fn cycle_is_reported_before_any_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let kits = vec![Kit::new("K")
        .with_target(target("K", "A").after(id("K", "B")))
        .with_target(target("K", "B").after(id("K", "A")))];
    let req = request(dir.path(), kits);

    match Engine::new(&req, Scripted::default()) {
        Err(Error::CycleError { cycle }) => {
            assert_eq!(cycle, vec![id("K", "A"), id("K", "B"), id("K", "A")]);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("cycle accepted"),
    }
    assert!(!ledger_path(dir.path()).exists());
}

#[tokio::test]
async fn corrupt_ledger_aborts_without_touching_it() {
    let dir = tempfile::tempdir().unwrap();
    let garbage = "target_id,kit,status\nK::a,K,MAYBE\n";
    std::fs::write(ledger_path(dir.path()), garbage).unwrap();

    let req = request(dir.path(), chain_kits());
    let err = Engine::new(&req, Scripted::default()).err().unwrap();
    assert!(matches!(err, Error::StateCorruptionError { .. }));
    assert!(err.is_startup());
    assert_eq!(std::fs::read_to_string(ledger_path(dir.path())).unwrap(), garbage);
}

#[tokio::test]
async fn zero_parallelism_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path(), chain_kits());
    req.config.parallelism = 0;
    assert!(matches!(
        Engine::new(&req, Scripted::default()),
        Err(Error::ConfigError(_))
    ));
}

// ===========================================================================
// Stop
// ===========================================================================

#[tokio::test]
async fn stop_before_start_dispatches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    let mut engine = Engine::new(&req, Scripted::default()).unwrap();
    engine.stop_handle().cancel();

    let summary = engine.run().await.unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.not_run, 4);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.exit_code(), 1);
    assert!(!ledger_path(dir.path()).exists());
}

#[tokio::test]
async fn stop_with_terminate_cancels_local_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path(), chain_kits());
    req.config.terminate_on_stop = true;
    let exec = Scripted::default()
        .with("K::a", Outcome::Hang)
        .with("K::d", Outcome::Hang);

    let mut engine = Engine::new(&req, exec).unwrap();
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
    });
    let summary = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("stopped run must wind down")
        .unwrap();

    assert!(summary.stopped);
    assert_eq!(engine.executor().cancelled.len(), 2);
    let s = statuses(dir.path());
    assert_eq!(s["K::a"], Status::Failed);
    assert_eq!(s["K::d"], Status::Failed);
    assert_eq!(s["K::b"], Status::Skipped);
}

#[tokio::test]
async fn stop_leaves_detached_jobs_running_for_resume() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    let exec = Scripted {
        detached: true,
        ..Scripted::default().with("K::a", Outcome::Hang)
    };

    let mut engine = Engine::new(&req, exec).unwrap();
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
    });
    let summary = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("detached jobs must not be awaited")
        .unwrap();

    assert!(summary.stopped);
    assert_eq!(summary.abandoned, 1);
    assert!(engine.executor().cancelled.is_empty());
    assert_eq!(statuses(dir.path())["K::a"], Status::Running);

    let (summary, exec) = run(&req, Scripted::default()).await;
    assert_eq!(exec.submitted(), vec!["K::a", "K::b", "K::c"]);
    assert!(summary.is_success());
}

/// Scheduler that is never available.
struct Unavailable {
    calls: std::sync::atomic::AtomicU32,
}

#[async_trait::async_trait]
impl repack_executor::BatchSystem for Unavailable {
    async fn submit(&self, _job: &JobSpec) -> Result<repack_executor::RemoteJobId, repack_executor::BatchError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(repack_executor::BatchError::Transient("queue temporarily unavailable".into()))
    }

    async fn query(
        &self,
        _ids: &[repack_executor::RemoteJobId],
    ) -> Result<HashMap<repack_executor::RemoteJobId, repack_executor::RemoteState>, repack_executor::BatchError> {
        Ok(HashMap::new())
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

#[tokio::test]
async fn stop_interrupts_submission_backoff() {
    use repack_executor::{BackoffConfig, ClusterConfig, ClusterExecutor};
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path(), chain_kits());
    let scheduler = Arc::new(Unavailable {
        calls: Default::default(),
    });
    let config = ClusterConfig {
        submit_attempts: 5,
        backoff: BackoffConfig {
            base_ms: 60_000,
            multiplier: 2.0,
            max_ms: 60_000,
        },
        ..ClusterConfig::default()
    };

    let mut engine = Engine::new(&req, ClusterExecutor::new(scheduler.clone(), config)).unwrap();
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
    });
    let summary = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("stop must cut the backoff short")
        .unwrap();

    assert!(summary.stopped);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.not_run, 4);
    // One attempt for K::a; K::d is never tried once the stop is seen.
    assert_eq!(scheduler.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    let s = statuses(dir.path());
    assert_eq!(s["K::a"], Status::Pending);
    assert_eq!(s["K::d"], Status::Pending);
}
