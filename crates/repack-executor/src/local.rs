//! Local executor: child processes on a bounded worker pool.

use crate::job::{Completion, JobHandle, JobResult, JobSpec, SubmitError};
use crate::Executor;
use repack_core::CommandSpec;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs each job as a child process. At most `parallelism` children run at
/// once; extra submissions wait for a free slot.
pub struct LocalExecutor {
    permits: Arc<Semaphore>,
    parallelism: usize,
    shell: String,
    next_handle: u64,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    running: HashMap<JobHandle, CancellationToken>,
}

impl LocalExecutor {
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            permits: Arc::new(Semaphore::new(parallelism)),
            parallelism,
            shell: "sh".to_string(),
            next_handle: 0,
            tx,
            rx,
            running: HashMap::new(),
        }
    }

    /// Shell used for [`CommandSpec::Shell`] commands (`<shell> -c <line>`).
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait::async_trait]
impl Executor for LocalExecutor {
    async fn submit(&mut self, job: JobSpec) -> Result<JobHandle, SubmitError> {
        if self.permits.is_closed() {
            return Err(SubmitError::Closed);
        }
        self.next_handle += 1;
        let handle = JobHandle(self.next_handle);
        let cancel = CancellationToken::new();
        self.running.insert(handle, cancel.clone());

        debug!(id = %job.target, %handle, "queued local job");
        tokio::spawn(run_job(
            handle,
            job,
            self.shell.clone(),
            self.permits.clone(),
            self.tx.clone(),
            cancel,
        ));
        Ok(handle)
    }

    async fn next_completion(&mut self) -> Option<Completion> {
        if self.running.is_empty() {
            return None;
        }
        let completion = self.rx.recv().await?;
        self.running.remove(&completion.handle);
        Some(completion)
    }

    async fn cancel(&mut self, handle: JobHandle) -> bool {
        match self.running.get(&handle) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.parallelism)
    }

    fn outstanding(&self) -> usize {
        self.running.len()
    }

    fn name(&self) -> &str {
        "local"
    }
}

async fn run_job(
    handle: JobHandle,
    job: JobSpec,
    shell: String,
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Completion>,
    cancel: CancellationToken,
) {
    let queued = Instant::now();
    let permit = tokio::select! {
        permit = permits.acquire_owned() => permit,
        _ = cancel.cancelled() => {
            let result = JobResult::abnormal("cancelled before start", queued.elapsed());
            let _ = tx.send(Completion { handle, result });
            return;
        }
    };
    let result = match permit {
        Ok(_permit) => execute(&job, &shell, &cancel).await,
        Err(_) => JobResult::abnormal("worker pool closed", queued.elapsed()),
    };
    if tx.send(Completion { handle, result }).is_err() {
        warn!(id = %job.target, %handle, "completion dropped: executor is gone");
    }
}

/// Run one job to completion (or until cancelled) and measure wall-clock time.
async fn execute(job: &JobSpec, shell: &str, cancel: &CancellationToken) -> JobResult {
    let started = Instant::now();

    let mut command = match build_command(&job.command, shell) {
        Some(c) => c,
        None => return JobResult::abnormal("empty command", started.elapsed()),
    };
    if let Some(cwd) = &job.cwd {
        command.current_dir(cwd);
    }
    command.envs(&job.env).stdin(Stdio::null()).kill_on_drop(true);

    match open_log(job) {
        Ok(Some(log)) => match log.try_clone() {
            Ok(err_log) => {
                command.stdout(Stdio::from(log)).stderr(Stdio::from(err_log));
            }
            Err(e) => return JobResult::abnormal(format!("log file: {e}"), started.elapsed()),
        },
        Ok(None) => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        Err(e) => return JobResult::abnormal(format!("log file: {e}"), started.elapsed()),
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return JobResult::abnormal(format!("failed to spawn: {e}"), started.elapsed()),
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => JobResult::exited(code, started.elapsed()),
                None => JobResult::abnormal(
                    format!("terminated abnormally: {status}"),
                    started.elapsed(),
                ),
            },
            Err(e) => JobResult::abnormal(format!("failed to wait: {e}"), started.elapsed()),
        },
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            JobResult::abnormal("terminated by stop request", started.elapsed())
        }
    }
}

fn build_command(spec: &CommandSpec, shell: &str) -> Option<Command> {
    match spec {
        CommandSpec::Shell(line) if !line.trim().is_empty() => {
            let mut c = Command::new(shell);
            c.arg("-c").arg(line);
            Some(c)
        }
        CommandSpec::Argv(args) => {
            let (program, rest) = args.split_first()?;
            if program.is_empty() {
                return None;
            }
            let mut c = Command::new(program);
            c.args(rest);
            Some(c)
        }
        CommandSpec::Shell(_) => None,
    }
}

/// Create the log file and write the run header.
fn open_log(job: &JobSpec) -> std::io::Result<Option<File>> {
    let Some(path) = &job.log_path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = File::create(path)?;
    writeln!(file, "Executing: {}", job.command)?;
    match &job.cwd {
        Some(cwd) => writeln!(file, "CWD: {}", cwd.display())?,
        None => writeln!(file, "CWD: .")?,
    }
    file.flush()?;
    Ok(Some(file))
}
