//! MRP CLI: compile, run, replay and validate Map/Reduce/Produce jobs.
//!
//! Machine-readable JSON goes to stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mrp_core::prelude::{Digest, EngineConfig, RunRecord};
use mrp_exec::{Engine, ExecError};
use mrp_operators::OperatorRegistry;
use mrp_planner::{load_job_file, normalize_document, Compiler};

/// Exit status of a run that sealed with a failure.
const EXIT_RUN_FAILED: u8 = 2;
/// Exit status of a replay whose digests differ from the original.
const EXIT_REPLAY_MISMATCH: u8 = 3;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "mrp")]
#[command(about = "Deterministic Map/Reduce/Produce job compiler and runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a job spec and print `{ir, manifest, policy}`
    Compile {
        /// Path to the job spec (YAML or JSON)
        #[arg(short, long)]
        job: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Compile and execute a job, printing the sealed run record
    Run {
        /// Path to the job spec (YAML or JSON)
        #[arg(short, long)]
        job: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Re-execute a sealed run and compare its result digests
    Replay {
        /// Digest of the run record to replay
        #[arg(short, long)]
        run: String,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Check a job spec against the schema without compiling it
    Validate {
        /// Path to the job spec (YAML or JSON)
        #[arg(short, long)]
        job: PathBuf,
    },
}

/// Engine settings layered over the environment (`MRP_*`) and an optional
/// config file.
#[derive(Args, Default)]
struct Overrides {
    /// Engine config file (YAML or JSON); unset fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Artifact store directory
    #[arg(long)]
    store_dir: Option<String>,

    /// Artifact store URI (file:///path or memory://)
    #[arg(long)]
    store_uri: Option<String>,

    /// Root directory for Produce outputs
    #[arg(long)]
    outputs_dir: Option<String>,

    /// Map concurrency cap
    #[arg(long)]
    max_workers: Option<usize>,

    /// Budget cap in cost units
    #[arg(long)]
    budget_cap: Option<f64>,

    /// Kill multiplier applied to the budget cap
    #[arg(long)]
    kill_threshold: Option<f64>,

    /// Retries per shard after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,

    /// Re-run every shard even if its output is cached
    #[arg(long)]
    no_cache: bool,
}

impl Overrides {
    fn engine_config(&self) -> CliResult<EngineConfig> {
        let mut cfg = match &self.config {
            Some(path) => load_config_file(path)?,
            None => EngineConfig::from_env(),
        };
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&self, cfg: &mut EngineConfig) {
        if let Some(dir) = &self.store_dir {
            cfg.store_dir = dir.clone();
        }
        if let Some(uri) = &self.store_uri {
            cfg.store_uri = Some(uri.clone());
        }
        if let Some(dir) = &self.outputs_dir {
            cfg.outputs_dir = dir.clone();
        }
        if let Some(n) = self.max_workers {
            cfg.max_workers = n;
        }
        if let Some(cap) = self.budget_cap {
            cfg.budget_cap = cap;
        }
        if let Some(k) = self.kill_threshold {
            cfg.kill_threshold = k;
        }
        if let Some(n) = self.max_retries {
            cfg.retry_max_retries = n;
        }
        if self.no_cache {
            cfg.shard_cache = false;
        }
    }
}

fn load_config_file(path: &Path) -> CliResult<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("reading config {}: {e}", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both.
    let cfg: EngineConfig = serde_yaml::from_str(&text)
        .map_err(|e| format!("parsing config {}: {e}", path.display()))?;
    debug!(path = %path.display(), "loaded engine config file");
    Ok(cfg)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MRP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn engine(cfg: EngineConfig) -> CliResult<Engine> {
    let registry = Arc::new(OperatorRegistry::with_builtins()?);
    Ok(Engine::new(cfg, registry)?)
}

fn compile_job(job: &Path, overrides: &Overrides) -> CliResult<()> {
    let cfg = overrides.engine_config()?;
    let registry = Arc::new(OperatorRegistry::with_builtins()?);
    let compiled = Compiler::new(registry, &cfg).compile_document(&load_job_file(job)?)?;
    print_json(&compiled)
}

#[derive(Serialize)]
struct RunOutput<'a> {
    digest: Digest,
    record: &'a RunRecord,
}

async fn run_job(job: &Path, overrides: &Overrides) -> CliResult<ExitCode> {
    let engine = engine(overrides.engine_config()?)?;
    let compiled = engine.compiler().compile_document(&load_job_file(job)?)?;
    let outcome = engine.run(&compiled).await?;
    print_json(&RunOutput {
        digest: outcome.digest,
        record: &outcome.record,
    })?;
    if let Err(e) = outcome.into_result() {
        eprintln!("Run failed: {e}");
        return Ok(ExitCode::from(EXIT_RUN_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

async fn replay_run(run: &str, overrides: &Overrides) -> CliResult<ExitCode> {
    let digest: Digest = run.trim().parse()?;
    let engine = engine(overrides.engine_config()?)?;
    let report = engine.replay(&digest).await?;
    print_json(&report)?;
    match report.into_result() {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(ExecError::ReplayMismatch { fields }) => {
            eprintln!("Replay mismatch: {}", fields.join(", "));
            Ok(ExitCode::from(EXIT_REPLAY_MISMATCH))
        }
        Err(e) => Err(e.into()),
    }
}

fn validate_job(job: &Path) -> CliResult<()> {
    let spec = normalize_document(&load_job_file(job)?)?;
    info!(job_id = %spec.job_id, shards = spec.map.shards.len(), "job spec is valid");
    print_json(&serde_json::json!({
        "job_id": spec.job_id,
        "valid": true,
        "shards": spec.map.shards.len(),
    }))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Compile { job, overrides } => compile_job(job, overrides).map(|_| ExitCode::SUCCESS),
        Commands::Run { job, overrides } => run_job(job, overrides).await,
        Commands::Replay { run, overrides } => replay_run(run, overrides).await,
        Commands::Validate { job } => validate_job(job).map(|_| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let overrides = Overrides {
            outputs_dir: Some("/tmp/out".into()),
            max_workers: Some(2),
            no_cache: true,
            ..Default::default()
        };
        let mut cfg = EngineConfig::default();
        overrides.apply(&mut cfg);
        assert_eq!(cfg.outputs_dir, "/tmp/out");
        assert_eq!(cfg.max_workers, 2);
        assert!(!cfg.shard_cache);
        assert_eq!(cfg.budget_cap, EngineConfig::default().budget_cap);
    }

    #[test]
    fn config_file_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(
            &path,
            "budget_cap: 50\nsandbox_profiles:\n  default: { endpoint: \"https://sbx.example\" }\n",
        )
        .unwrap();
        let cfg = load_config_file(&path).unwrap();
        assert_eq!(cfg.budget_cap, 50.0);
        assert_eq!(cfg.max_workers, EngineConfig::default().max_workers);
        assert!(cfg.sandbox_profile(None).is_some());
    }

    #[test]
    fn cli_parses_replay() {
        let cli = Cli::try_parse_from(["mrp", "replay", "--run", "abc", "--no-cache"]).unwrap();
        match cli.command {
            Commands::Replay { run, overrides } => {
                assert_eq!(run, "abc");
                assert!(overrides.no_cache);
            }
            _ => panic!("expected replay"),
        }
    }
}
