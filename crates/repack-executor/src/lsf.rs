//! LSF adapter: `bsub` to submit, `bjobs` to poll, `bkill` to cancel.

use crate::cluster::{BatchError, BatchSystem, RemoteJobId, RemoteState};
use crate::job::JobSpec;
use regex::Regex;
use repack_core::CommandSpec;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Scheduler messages that mean "try again later".
const TRANSIENT_MARKERS: &[&str] = &[
    "temporarily unavailable",
    "try again",
    "not responding",
    "lsf is down",
    "cannot connect",
    "timed out",
];

pub struct LsfBatchSystem {
    queue: Option<String>,
    extra_args: Vec<String>,
    command_timeout: Duration,
}

impl Default for LsfBatchSystem {
    fn default() -> Self {
        Self {
            queue: None,
            extra_args: Vec::new(),
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl LsfBatchSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: Option<String>) -> Self {
        self.queue = queue.filter(|q| !q.is_empty());
        self
    }

    /// Site-specific `bsub` flags, e.g. `["-R", "rusage[mem=4000]"]`.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Arguments passed to `bsub` for one job.
    pub fn bsub_args(&self, job: &JobSpec) -> Vec<String> {
        let mut args = vec!["-J".to_string(), job.target.to_string()];
        if let Some(log) = &job.log_path {
            let log = log.display().to_string();
            args.extend(["-o".to_string(), log.clone(), "-e".to_string(), log]);
        }
        if let Some(queue) = &self.queue {
            args.extend(["-q".to_string(), queue.clone()]);
        }
        if let Some(cwd) = &job.cwd {
            args.extend(["-cwd".to_string(), cwd.display().to_string()]);
        }
        if !job.env.is_empty() {
            let vars: Vec<String> = job.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
            args.extend(["-env".to_string(), format!("all, {}", vars.join(", "))]);
        }
        args.extend(self.extra_args.iter().cloned());
        match &job.command {
            CommandSpec::Shell(line) => args.push(line.clone()),
            CommandSpec::Argv(argv) => args.extend(argv.iter().cloned()),
        }
        args
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Output, BatchError> {
        debug!(program, ?args, "lsf command");
        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;
        match output {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BatchError::Fatal(format!("{program} not found: is LSF installed?")))
            }
            Ok(Err(e)) => Err(BatchError::Transient(format!("{program}: {e}"))),
            Err(_) => Err(BatchError::Transient(format!(
                "{program} timed out after {}s",
                self.command_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl BatchSystem for LsfBatchSystem {
    async fn submit(&self, job: &JobSpec) -> Result<RemoteJobId, BatchError> {
        if let Some(parent) = job.log_path.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BatchError::Fatal(format!("log directory {}: {e}", parent.display())))?;
            }
        }

        let output = self.run("bsub", &self.bsub_args(job)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify(&format!("bsub failed: {}", stderr.trim())));
        }
        parse_job_id(&stdout)
            .ok_or_else(|| BatchError::Fatal(format!("could not parse LSF job id from: {}", stdout.trim())))
    }

    async fn query(&self, ids: &[RemoteJobId]) -> Result<HashMap<RemoteJobId, RemoteState>, BatchError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut args = vec![
            "-noheader".to_string(),
            "-o".to_string(),
            "jobid stat exit_code".to_string(),
        ];
        args.extend(ids.iter().map(|id| id.0.clone()));

        let output = self.run("bjobs", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let states = parse_bjobs(&stdout);

        // bjobs exits non-zero when any job is unknown; that alone is not an error.
        if !output.status.success() && states.is_empty() && !stderr.contains("not found") {
            return Err(classify(&format!("bjobs failed: {}", stderr.trim())));
        }
        Ok(states)
    }

    async fn cancel(&self, id: &RemoteJobId) -> Result<(), BatchError> {
        let output = self.run("bkill", std::slice::from_ref(&id.0)).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify(&format!("bkill failed: {}", stderr.trim())))
        }
    }

    fn name(&self) -> &str {
        "lsf"
    }
}

/// Extract `<N>` from bsub's "Job <N> is submitted to queue <q>." banner.
pub fn parse_job_id(stdout: &str) -> Option<RemoteJobId> {
    let re = Regex::new(r"Job <(\d+)>").ok()?;
    re.captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| RemoteJobId(m.as_str().to_string()))
}

pub fn parse_state(stat: &str, exit_code: Option<&str>) -> RemoteState {
    match stat {
        "PEND" | "PSUSP" | "WAIT" => RemoteState::Pending,
        "RUN" | "USUSP" | "SSUSP" | "PROV" => RemoteState::Running,
        "DONE" => RemoteState::Done,
        "EXIT" => RemoteState::Exit(exit_code.and_then(|c| c.parse().ok())),
        _ => RemoteState::Unknown,
    }
}

/// Parse `bjobs -noheader -o "jobid stat exit_code"` output. Missing exit
/// codes are printed as `-`.
fn parse_bjobs(stdout: &str) -> HashMap<RemoteJobId, RemoteState> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?;
            if !id.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let stat = fields.next()?;
            let state = parse_state(stat, fields.next());
            (state != RemoteState::Unknown).then(|| (RemoteJobId(id.to_string()), state))
        })
        .collect()
}

fn classify(message: &str) -> BatchError {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        BatchError::Transient(message.to_string())
    } else {
        BatchError::Fatal(message.to_string())
    }
}
