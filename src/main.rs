//! repack - run kit builds in dependency order, resumably
//!
//! Usage:
//!   repack run kits.yaml                 → build everything not yet DONE
//!   repack run kits.yaml --kit KitB      → KitB plus the kits it needs
//!   repack run kits.yaml --force         → rebuild DONE targets too
//!   repack plan kits.yaml                → show dispatch order, touch nothing
//!   repack status                        → show the ledger
//!   repack config > repack.toml          → write out the effective settings

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use repack::{select_kits, KitManifest, RepackConfig, RunOverrides, DEFAULT_CONFIG_FILE};
use repack_core::{Kit, KitGraph, RepackRequest, Status, StatusLedger};
use repack_engine::Engine;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "repack",
    about = "Resumable, dependency-ordered kit builds",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Emit logs (and the run summary) as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every target that is not already DONE
    Run {
        #[command(flatten)]
        kits: KitArgs,

        /// Jobs admitted at once
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Executor backend: local or cluster
        #[arg(short, long)]
        executor: Option<String>,

        /// Status ledger (CSV). Only one run may use a ledger at a time
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Re-run targets that are already DONE
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Kill running local jobs on Ctrl-C instead of waiting for them
        #[arg(long, default_value_t = false)]
        terminate_on_stop: bool,
    },
    /// Print the dispatch order without running anything
    Plan {
        #[command(flatten)]
        kits: KitArgs,
    },
    /// Print the status ledger
    Status {
        /// Status ledger (CSV)
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Print the effective run configuration as TOML
    Config,
}

#[derive(Args)]
struct KitArgs {
    /// Kit definition file (YAML)
    kits_file: PathBuf,

    /// Only these kits (and the kits they depend on)
    #[arg(short, long = "kit")]
    kit: Vec<String>,
}

impl KitArgs {
    fn load(&self) -> anyhow::Result<Vec<Kit>> {
        let manifest = KitManifest::load(&self.kits_file)?;
        let base = self
            .kits_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let kits = manifest.into_kits(base)?;
        Ok(select_kits(kits, &self.kit)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let guard = repack::logging::init_tracing(cli.json, cli.log_file.as_deref())?;

    let mut config = RepackConfig::load(&cli.config)?;

    let code = match cli.command {
        Commands::Run {
            kits,
            parallelism,
            executor,
            ledger,
            force,
            terminate_on_stop,
        } => {
            config.apply(&RunOverrides {
                parallelism,
                executor,
                ledger,
                force,
                terminate_on_stop,
            });
            run(&config, &kits, cli.json).await?
        }
        Commands::Plan { kits } => {
            plan(&kits.load()?)?;
            0
        }
        Commands::Status { ledger } => {
            config.apply(&RunOverrides {
                ledger,
                ..RunOverrides::default()
            });
            status(&config.run.ledger)?;
            0
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            0
        }
    };

    // Flush the file writer before exiting with the run's code.
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(config: &RepackConfig, kits: &KitArgs, json: bool) -> anyhow::Result<i32> {
    let run_config = config.run_config()?;
    let request = RepackRequest::new(kits.load()?, run_config.clone());
    let executor = config.executor(&run_config);

    let mut engine = Engine::new(&request, executor)
        .with_context(|| format!("cannot start run from {}", kits.kits_file.display()))?;

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after in-flight jobs");
            stop.cancel();
        }
    });

    let summary = engine.run().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{summary}");
    }
    if summary.abandoned > 0 {
        eprintln!(
            "note: remote jobs are not cancelled on stop; {} may still be running on the cluster",
            summary.abandoned
        );
    }
    Ok(summary.exit_code())
}

fn plan(kits: &[Kit]) -> anyhow::Result<()> {
    let graph = KitGraph::from_kits(kits)?;
    for (pos, &idx) in graph.topological_order().iter().enumerate() {
        let target = graph.target(idx);
        println!("{:>4}. {}  -> {}", pos + 1, target.id, target.output_path.display());
        let deps: Vec<String> = graph
            .dependencies(idx)
            .iter()
            .map(|&d| graph.target(d).id.to_string())
            .collect();
        if !deps.is_empty() {
            println!("        after: {}", deps.join(", "));
        }
    }
    println!("{} targets", graph.len());
    Ok(())
}

fn status(ledger: &Path) -> anyhow::Result<()> {
    let records = StatusLedger::load(ledger)?;
    if records.is_empty() {
        println!("No ledger at {}", ledger.display());
        return Ok(());
    }
    let mut rows: Vec<_> = records.values().collect();
    rows.sort_by(|a, b| a.id.cmp(&b.id));

    for r in &rows {
        let exit = r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        let finished = r.finished_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
        println!("{:<40} {:<8} {:>4}  {}", r.id.to_string(), r.status.as_str(), exit, finished);
    }
    let counts: Vec<String> = Status::ALL
        .iter()
        .map(|s| (s, rows.iter().filter(|r| r.status == *s).count()))
        .filter(|(_, n)| *n > 0)
        .map(|(s, n)| format!("{n} {}", s.as_str().to_lowercase()))
        .collect();
    println!("{} targets: {}", rows.len(), counts.join(", "));
    Ok(())
}
