//! Run configuration (`repack.toml`)
//!
//! Every section is optional; a missing file means defaults throughout.
//! Command-line flags are applied on top through [`RunOverrides`].

use repack_core::{Error, ExecutorKind, Result, RunConfig};
use repack_executor::{
    BackoffConfig, ClusterConfig, ClusterExecutor, Executor, LocalExecutor, LsfBatchSystem,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "repack.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepackConfig {
    pub run: RunSection,
    pub local: LocalSection,
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Jobs admitted at once by the local executor.
    pub parallelism: usize,
    /// `local` or `cluster`.
    pub executor: String,
    pub ledger: PathBuf,
    pub force: bool,
    pub terminate_on_stop: bool,
    /// Per-target logs. Defaults to `logs/` next to the ledger.
    pub log_dir: Option<PathBuf>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            parallelism: 4,
            executor: "local".into(),
            ledger: PathBuf::from("repack_status.csv"),
            force: false,
            terminate_on_stop: false,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    /// Shell for string commands.
    pub shell: String,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self { shell: "sh".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub poll_interval_ms: u64,
    /// 0 = no cap.
    pub max_in_flight: usize,
    pub submit_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub unknown_poll_limit: u32,
    pub queue: Option<String>,
    /// Site-specific submission flags, passed through verbatim.
    pub extra_args: Vec<String>,
    /// Limit on a single bsub/bjobs/bkill invocation.
    pub command_timeout_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            poll_interval_ms: 5000,
            max_in_flight: 0,
            submit_attempts: 3,
            backoff_base_ms: backoff.base_ms,
            backoff_multiplier: backoff.multiplier,
            backoff_max_ms: backoff.max_ms,
            unknown_poll_limit: 3,
            queue: None,
            extra_args: Vec::new(),
            command_timeout_secs: 60,
        }
    }
}

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub parallelism: Option<usize>,
    pub executor: Option<String>,
    pub ledger: Option<PathBuf>,
    pub force: bool,
    pub terminate_on_stop: bool,
}

impl RepackConfig {
    /// Load from `path`. A missing file yields defaults; a malformed one is a
    /// [`Error::ConfigError`].
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml(&content)
                    .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
                tracing::info!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(e.to_string()))
    }

    /// Render as TOML, e.g. to seed a `repack.toml`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(format!("cannot render config: {e}")))
    }

    pub fn apply(&mut self, overrides: &RunOverrides) {
        if let Some(p) = overrides.parallelism {
            self.run.parallelism = p;
        }
        if let Some(kind) = &overrides.executor {
            self.run.executor = kind.clone();
        }
        if let Some(ledger) = &overrides.ledger {
            self.run.ledger = ledger.clone();
        }
        self.run.force |= overrides.force;
        self.run.terminate_on_stop |= overrides.terminate_on_stop;
    }

    /// Validated per-run settings.
    pub fn run_config(&self) -> Result<RunConfig> {
        let config = RunConfig {
            parallelism: self.run.parallelism,
            executor: self.run.executor.parse::<ExecutorKind>()?,
            ledger_path: self.run.ledger.clone(),
            force: self.run.force,
            terminate_on_stop: self.run.terminate_on_stop,
            log_dir: self.run.log_dir.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        let c = &self.cluster;
        ClusterConfig {
            poll_interval: Duration::from_millis(c.poll_interval_ms.max(1)),
            max_in_flight: c.max_in_flight,
            submit_attempts: c.submit_attempts,
            backoff: BackoffConfig {
                base_ms: c.backoff_base_ms,
                multiplier: c.backoff_multiplier,
                max_ms: c.backoff_max_ms,
            },
            unknown_poll_limit: c.unknown_poll_limit,
        }
    }

    /// The executor backend selected by `run`.
    pub fn executor(&self, run: &RunConfig) -> Box<dyn Executor> {
        match run.executor {
            ExecutorKind::Local => {
                Box::new(LocalExecutor::new(run.parallelism).with_shell(self.local.shell.clone()))
            }
            ExecutorKind::Cluster => {
                let lsf = LsfBatchSystem::new()
                    .with_queue(self.cluster.queue.clone())
                    .with_extra_args(self.cluster.extra_args.clone())
                    .with_command_timeout(Duration::from_secs(self.cluster.command_timeout_secs));
                Box::new(ClusterExecutor::new(Arc::new(lsf), self.cluster_config()))
            }
        }
    }
}
