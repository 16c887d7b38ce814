//! Kit, target and status types shared by every repack crate

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Separator between kit and target name in a rendered target identity.
pub const ID_SEPARATOR: &str = "::";

// ---------------------------------------------------------------------------
// Target identity
// ---------------------------------------------------------------------------

/// Globally unique identity of a target: `(kit_name, target_name)`.
///
/// Rendered as `kit::target` in the ledger and in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TargetId {
    kit: String,
    target: String,
}

impl TargetId {
    pub fn new(kit: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kit: kit.into(),
            target: target.into(),
        }
    }

    pub fn kit(&self) -> &str {
        &self.kit
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Parse a `kit::target` string. Both halves must be non-empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (kit, target) = s.split_once(ID_SEPARATOR)?;
        if kit.is_empty() || target.is_empty() || target.contains(ID_SEPARATOR) {
            return None;
        }
        Some(Self::new(kit, target))
    }

    /// True when the rendered `kit::target` form parses back to this id.
    ///
    /// Fails for empty halves, a separator inside either name, and names
    /// whose colons merge with the separator (`A:` + `b`, `A` + `:b`).
    pub fn is_well_formed(&self) -> bool {
        Self::parse(&self.to_string()).as_ref() == Some(self)
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.kit, ID_SEPARATOR, self.target)
    }
}

impl FromStr for TargetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| {
            Error::config(format!("invalid target id '{s}' (expected kit{ID_SEPARATOR}target)"))
        })
    }
}

impl From<TargetId> for String {
    fn from(id: TargetId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TargetId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// What a target runs. Opaque to the graph and the engine; only executors look inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// A command line handed to the shell.
    Shell(String),
    /// An argv vector executed directly.
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn shell(line: impl Into<String>) -> Self {
        Self::Shell(line.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Shell(line) => line.trim().is_empty(),
            Self::Argv(args) => args.first().map_or(true, |a| a.is_empty()),
        }
    }

    /// Single-line rendering, used in log headers and for batch submission.
    pub fn to_command_line(&self) -> String {
        match self {
            Self::Shell(line) => line.clone(),
            Self::Argv(args) => args.join(" "),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_command_line())
    }
}

// ---------------------------------------------------------------------------
// Kits and targets
// ---------------------------------------------------------------------------

/// A single unit of work inside a kit.
#[derive(Debug, Clone, PartialEq)]
pub struct KitTarget {
    pub id: TargetId,
    pub command: CommandSpec,
    pub output_path: PathBuf,
    /// Explicit target-level dependencies, on top of those expanded from kit-level deps.
    pub depends_on: Vec<TargetId>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl KitTarget {
    pub fn new(
        kit: impl Into<String>,
        name: impl Into<String>,
        command: CommandSpec,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: TargetId::new(kit, name),
            command,
            output_path: output_path.into(),
            depends_on: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn after(mut self, dependency: TargetId) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// A named bundle of targets plus the kits that must fully complete first.
#[derive(Debug, Clone, PartialEq)]
pub struct Kit {
    pub name: String,
    pub targets: Vec<KitTarget>,
    pub depends_on_kits: Vec<String>,
}

impl Kit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: Vec::new(),
            depends_on_kits: Vec::new(),
        }
    }

    /// Add a target owned by this kit.
    pub fn target(mut self, name: &str, command: CommandSpec, output_path: impl Into<PathBuf>) -> Self {
        let target = KitTarget::new(self.name.clone(), name, command, output_path);
        self.targets.push(target);
        self
    }

    pub fn with_target(mut self, target: KitTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn depends_on(mut self, kit: impl Into<String>) -> Self {
        self.depends_on_kits.push(kit.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Run request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Local,
    Cluster,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cluster" => Ok(Self::Cluster),
            other => Err(Error::config(format!(
                "unknown executor kind '{other}' (expected local or cluster)"
            ))),
        }
    }
}

/// Per-run settings carried alongside the kits.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Maximum number of jobs admitted at once.
    pub parallelism: usize,
    pub executor: ExecutorKind,
    pub ledger_path: PathBuf,
    /// Re-dispatch targets that are already DONE.
    pub force: bool,
    /// Kill running local jobs on a stop request instead of letting them finish.
    pub terminate_on_stop: bool,
    /// Where per-target logs go. Defaults to `logs/` next to the ledger.
    pub log_dir: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            parallelism: 4,
            executor: ExecutorKind::Local,
            ledger_path: ledger_path.into(),
            force: false,
            terminate_on_stop: false,
            log_dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }
        if self.ledger_path.as_os_str().is_empty() {
            return Err(Error::config("ledger path must not be empty"));
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => dir.clone(),
            None => self
                .ledger_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("logs"),
        }
    }

    /// Log file for one target: `<log_dir>/<kit>__<target>.log`.
    pub fn log_path(&self, id: &TargetId) -> PathBuf {
        self.log_dir()
            .join(format!("{}__{}.log", id.kit(), id.target()))
    }
}

/// The kits selected for one run plus its configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RepackRequest {
    pub kits: Vec<Kit>,
    pub config: RunConfig,
}

impl RepackRequest {
    pub fn new(kits: Vec<Kit>, config: RunConfig) -> Self {
        Self { kits, config }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Running,
        Status::Done,
        Status::Failed,
        Status::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Parse a ledger token. Tokens are exact and upper-case.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == token)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// FAILED or SKIPPED: dependents of such a target are skipped.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted projection of one target. One row per identity in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub id: TargetId,
    pub status: Status,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_path: PathBuf,
}

impl StatusRecord {
    pub fn pending(id: TargetId, output_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            status: Status::Pending,
            exit_code: None,
            started_at: None,
            finished_at: None,
            output_path: output_path.into(),
        }
    }

    /// Back to PENDING with the previous attempt's run data cleared.
    pub fn reset(&mut self) {
        self.status = Status::Pending;
        self.exit_code = None;
        self.started_at = None;
        self.finished_at = None;
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = Status::Running;
        self.exit_code = None;
        self.started_at = Some(at);
        self.finished_at = None;
    }

    pub fn mark_finished(&mut self, status: Status, exit_code: Option<i32>, at: DateTime<Utc>) {
        self.status = status;
        self.exit_code = exit_code;
        self.finished_at = Some(at);
    }

    pub fn mark_skipped(&mut self, at: DateTime<Utc>) {
        self.status = Status::Skipped;
        self.exit_code = None;
        self.started_at = None;
        self.finished_at = Some(at);
    }
}
