//! The dispatch loop.
//!
//! One engine owns one run: the graph, the authoritative status of every
//! target and the ledger that mirrors it. Readiness is recomputed after every
//! transition, so completions may arrive in any order.

use crate::summary::RunSummary;
use chrono::Utc;
use repack_core::{Error, KitGraph, RepackRequest, Result, RunConfig, Status, StatusLedger, StatusRecord};
use repack_executor::{Completion, Executor, JobHandle, JobSpec, SubmitError};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Engine<E: Executor> {
    graph: KitGraph,
    /// Indexed like the graph's nodes.
    records: Vec<StatusRecord>,
    ledger: StatusLedger,
    executor: E,
    config: RunConfig,
    stop: CancellationToken,
    in_flight: HashMap<JobHandle, usize>,
    dispatched: usize,
}

impl<E: Executor> Engine<E> {
    /// Build the graph and load the ledger. Any error here happens before a
    /// single job is dispatched or a single ledger byte is written.
    pub fn new(request: &RepackRequest, mut executor: E) -> Result<Self> {
        let config = request.config.clone();
        config.validate()?;
        let graph = KitGraph::build(request)?;
        let loaded = StatusLedger::load(&config.ledger_path)?;

        let mut records = StatusLedger::reconcile(&graph, loaded);
        for record in &mut records {
            let rearm = match record.status {
                Status::Failed | Status::Skipped => true,
                Status::Done => config.force,
                Status::Pending | Status::Running => false,
            };
            if rearm {
                debug!(id = %record.id, was = %record.status, "target re-armed");
                record.reset();
            }
        }

        let ledger = StatusLedger::new(&config.ledger_path, records.clone());
        let stop = CancellationToken::new();
        executor.watch_stop(stop.clone());
        Ok(Self {
            graph,
            records,
            ledger,
            executor,
            config,
            stop,
            in_flight: HashMap::new(),
            dispatched: 0,
        })
    }

    /// Token that requests a stop: no further dispatch, then wind down.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn graph(&self) -> &KitGraph {
        &self.graph
    }

    pub fn records(&self) -> &[StatusRecord] {
        &self.records
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn into_executor(self) -> E {
        self.executor
    }

    /// Run until every target is resolved or a stop winds the run down.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let stop = self.stop.clone();
        let mut stopping = false;

        info!(
            targets = self.graph.len(),
            executor = self.executor.name(),
            ledger = %self.config.ledger_path.display(),
            "run started"
        );

        loop {
            if !stopping && stop.is_cancelled() {
                stopping = true;
                self.begin_stop().await;
            }
            if !stopping {
                self.pump().await?;
                if stop.is_cancelled() {
                    continue;
                }
            } else {
                self.propagate_skips()?;
            }

            if self.in_flight.is_empty() {
                break;
            }
            if stopping && self.executor.detached_on_stop() {
                warn!(
                    jobs = self.in_flight.len(),
                    "remote jobs keep running after stop; they stay RUNNING in the ledger"
                );
                break;
            }

            let completion = if stopping {
                self.executor.next_completion().await
            } else {
                tokio::select! {
                    c = self.executor.next_completion() => c,
                    _ = stop.cancelled() => continue,
                }
            };

            match completion {
                Some(c) => self.complete(c)?,
                None => self.fail_lost_jobs()?,
            }
        }

        let summary = RunSummary::from_records(&self.records, self.dispatched, stopping, started.elapsed());
        info!(
            done = summary.done,
            failed = summary.failed,
            skipped = summary.skipped,
            not_run = summary.not_run,
            dispatched = summary.dispatched,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(summary)
    }

    /// Resolve skips and dispatch ready targets until nothing else can start.
    async fn pump(&mut self) -> Result<()> {
        let limit = self.executor.capacity().unwrap_or(usize::MAX);
        loop {
            let ready = self.propagate_skips()?;
            let mut rejected = false;
            for idx in ready {
                if self.in_flight.len() >= limit || self.stop.is_cancelled() {
                    return Ok(());
                }
                if !self.dispatch(idx).await? {
                    rejected = true;
                }
            }
            // A rejected submission is a new FAILED target whose dependents
            // must be skipped before anything else is considered.
            if !rejected {
                return Ok(());
            }
        }
    }

    /// Walk the graph in topological order: PENDING targets below a FAILED or
    /// SKIPPED dependency become SKIPPED; the rest with every dependency DONE
    /// are returned as ready, in dispatch priority order.
    fn propagate_skips(&mut self) -> Result<Vec<usize>> {
        let mut ready = Vec::new();
        for pos in 0..self.graph.len() {
            let idx = self.graph.topological_order()[pos];
            if self.records[idx].status != Status::Pending {
                continue;
            }
            let deps = self.graph.dependencies(idx);
            if let Some(&blocker) = deps.iter().find(|&&d| self.records[d].status.blocks_dependents()) {
                let blocker = self.graph.target(blocker).id.clone();
                let record = &mut self.records[idx];
                record.mark_skipped(Utc::now());
                warn!(id = %record.id, because = %blocker, "target skipped");
                self.ledger.upsert(record.clone())?;
            } else if deps.iter().all(|&d| self.records[d].status == Status::Done) {
                ready.push(idx);
            }
        }
        Ok(ready)
    }

    /// Mark one target RUNNING (durably) and hand it to the executor.
    /// Returns false when the executor refused it.
    async fn dispatch(&mut self, idx: usize) -> Result<bool> {
        let target = self.graph.target(idx);
        let job = JobSpec::from_target(target, Some(self.config.log_path(&target.id)));

        let record = &mut self.records[idx];
        record.mark_running(Utc::now());
        self.ledger.upsert(record.clone())?;

        match self.executor.submit(job).await {
            Ok(handle) => {
                info!(id = %self.records[idx].id, %handle, "dispatched");
                self.in_flight.insert(handle, idx);
                self.dispatched += 1;
                Ok(true)
            }
            Err(SubmitError::Interrupted) => {
                let record = &mut self.records[idx];
                debug!(id = %record.id, "submission interrupted, target stays PENDING");
                record.reset();
                self.ledger.upsert(record.clone())?;
                Ok(true)
            }
            Err(e) => {
                let record = &mut self.records[idx];
                let err = Error::submission(record.id.clone(), e.to_string());
                warn!(id = %record.id, error = %err, "target failed");
                record.mark_finished(Status::Failed, None, Utc::now());
                self.ledger.upsert(record.clone())?;
                Ok(false)
            }
        }
    }

    fn complete(&mut self, completion: Completion) -> Result<()> {
        let Some(idx) = self.in_flight.remove(&completion.handle) else {
            warn!(handle = %completion.handle, "completion for unknown job ignored");
            return Ok(());
        };
        let result = completion.result;
        let status = if result.success() { Status::Done } else { Status::Failed };

        let record = &mut self.records[idx];
        record.mark_finished(status, result.exit_code, Utc::now());
        self.ledger.upsert(record.clone())?;

        let duration_ms = result.duration.as_millis() as u64;
        match result.failure_reason() {
            None => info!(id = %record.id, duration_ms, "target done"),
            Some(reason) => {
                let err = Error::runtime(record.id.clone(), reason);
                warn!(id = %record.id, exit_code = ?result.exit_code, duration_ms, error = %err, "target failed");
            }
        }
        Ok(())
    }

    /// The executor reported nothing outstanding while the engine still
    /// tracks jobs. Those jobs will never complete.
    fn fail_lost_jobs(&mut self) -> Result<()> {
        error!(jobs = self.in_flight.len(), executor = self.executor.name(), "executor lost track of jobs");
        let mut lost: Vec<usize> = self.in_flight.drain().map(|(_, idx)| idx).collect();
        lost.sort_unstable();
        for idx in lost {
            let record = &mut self.records[idx];
            record.mark_finished(Status::Failed, None, Utc::now());
            self.ledger.upsert(record.clone())?;
        }
        Ok(())
    }

    async fn begin_stop(&mut self) {
        warn!(in_flight = self.in_flight.len(), "stop requested, no further dispatch");
        if !self.config.terminate_on_stop || self.executor.detached_on_stop() {
            return;
        }
        let mut handles: Vec<JobHandle> = self.in_flight.keys().copied().collect();
        handles.sort_unstable();
        for handle in handles {
            if self.executor.cancel(handle).await {
                debug!(%handle, "cancel issued");
            }
        }
    }
}

/// Build an engine for `request` and run it to the end.
pub async fn run_request<E: Executor>(request: &RepackRequest, executor: E) -> Result<RunSummary> {
    Engine::new(request, executor)?.run().await
}
