//! ePTM batch CLI
//!
//! The `eptm-batch` command drives many instances of the ePTM particle
//! tracking engine, one per release of a study.
//!
//! ## Commands
//!
//! - `run`: launch every design point of a study and write a manifest
//! - `plan`: print design points and engine command lines without launching
//! - `check`: resolve and validate the configuration only
//!
//! Exit status is 0 when every release succeeded, 1 when any release failed
//! or the batch was cancelled, and 2 on configuration or usage errors.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};

use eptm_core::{
    build, init_tracing, resolve, ConfigError, ConfigOverrides, DesignPointError, EngineSpec,
    RawConfig, RunConfig,
};
use eptm_runner::{BatchCoordinator, BatchManifest, CapturedStdio};

/// Config file read when `--config` is not given, if it exists.
const DEFAULT_CONFIG_FILE: &str = "eptm.toml";

#[derive(Parser)]
#[command(name = "eptm-batch")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Batch-run orchestrator for the ePTM particle tracking engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every design point of a study
    Run {
        /// Study id, or a single release id when no such study is declared
        study_id: String,

        #[command(flatten)]
        config: ConfigArgs,

        /// Manifest file (default: <output_dir>/<STUDY_ID>.manifest.json)
        #[arg(short, long, env = "EPTM_MANIFEST")]
        manifest: Option<PathBuf>,

        /// Print the plan instead of launching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Print design points and engine command lines without launching
    Plan {
        study_id: String,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Resolve and validate the configuration
    Check {
        /// Study to validate (default: every declared study)
        study_id: Option<String>,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Config file location and overrides shared by every command.
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// TOML config file (default: ./eptm.toml when present)
    #[arg(short, long, env = "EPTM_CONFIG")]
    config: Option<PathBuf>,

    /// Engine jar, run with the configured Java runtime
    #[arg(long, env = "EPTM_ENGINE_JAR")]
    engine_jar: Option<PathBuf>,

    /// Native engine executable, used instead of a jar
    #[arg(long, env = "EPTM_ENGINE")]
    engine: Option<PathBuf>,

    /// Java runtime for jar engines
    #[arg(long, env = "EPTM_JAVA")]
    runtime: Option<String>,

    /// Directory holding grid and mixing-profile files
    #[arg(long, env = "EPTM_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory holding behavior/calibration files
    #[arg(long, env = "EPTM_CALIB_DIR")]
    calibration_dir: Option<PathBuf>,

    /// Directory receiving engine output
    #[arg(long, env = "EPTM_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Maximum number of concurrent engine processes (1 = serial)
    #[arg(short, long, env = "EPTM_MAX_PARALLEL")]
    parallel: Option<usize>,

    /// Per-release time limit in seconds
    #[arg(short, long, env = "EPTM_TIMEOUT_SECS")]
    timeout: Option<u64>,
}

impl ConfigArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            engine_jar: self.engine_jar.clone(),
            engine_executable: self.engine.clone(),
            runtime: self.runtime.clone(),
            config_dir: self.config_dir.clone(),
            calibration_dir: self.calibration_dir.clone(),
            output_dir: self.output_dir.clone(),
            max_parallel: self.parallel,
            timeout_secs: self.timeout,
        }
    }

    /// Load the config file (if any) and overlay flags and `EPTM_*` vars.
    fn load(&self) -> Result<RawConfig> {
        let mut raw = match &self.config {
            Some(path) => RawConfig::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                RawConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => RawConfig::default(),
        };
        raw.apply_overrides(&self.overrides());
        Ok(raw)
    }
}

/// Batch verdict, mapped to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failed,
}

impl From<Verdict> for ExitCode {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Success => ExitCode::SUCCESS,
            Verdict::Failed => ExitCode::from(1),
        }
    }
}

/// 2 for configuration problems, 1 for anything that went wrong mid-batch.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let config_error = err
        .chain()
        .any(|cause| cause.is::<ConfigError>() || cause.is::<DesignPointError>());
    if config_error {
        2
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let verdict = match cli.command {
        Commands::Run {
            study_id,
            config,
            manifest,
            dry_run,
        } => {
            if dry_run {
                cmd_plan(&config, &study_id)
            } else {
                cmd_run(&config, &study_id, manifest.as_deref()).await
            }
        }
        Commands::Plan { study_id, config } => cmd_plan(&config, &study_id),
        Commands::Check { study_id, config } => cmd_check(&config, study_id.as_deref()),
    };

    match verdict {
        Ok(verdict) => verdict.into(),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn resolve_study(args: &ConfigArgs, study_id: &str) -> Result<RunConfig> {
    let raw = args.load()?;
    let config = resolve(&raw, study_id)
        .with_context(|| format!("invalid configuration for study {study_id}"))?;
    Ok(config)
}

async fn cmd_run(args: &ConfigArgs, study_id: &str, manifest: Option<&Path>) -> Result<Verdict> {
    let config = Arc::new(resolve_study(args, study_id)?);
    let manifest_path = manifest
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.output_dir.join(format!("{study_id}.manifest.json")));
    let journal_path = manifest_path.with_extension("jsonl");

    let coordinator = BatchCoordinator::new().with_journal(&journal_path);
    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            cancel.cancel();
        }
    });

    let policy = config.execution.policy;
    let manifest = coordinator
        .run_batch(Arc::clone(&config), study_id, policy)
        .await
        .with_context(|| format!("batch for study {study_id} failed"))?;

    manifest
        .write_json(&manifest_path)
        .context("Failed to write manifest")?;
    info!(manifest = %manifest_path.display(), journal = %journal_path.display(), "manifest written");

    print_summary(&manifest, &manifest_path);
    Ok(if manifest.success {
        Verdict::Success
    } else {
        Verdict::Failed
    })
}

fn print_summary(manifest: &BatchManifest, manifest_path: &Path) {
    println!("Study:     {}", manifest.study_id);
    println!("Batch:     {}", manifest.batch_id);
    println!(
        "Releases:  {} attempted, {} passed, {} failed",
        manifest.attempted(),
        manifest.passed_count(),
        manifest.failed_count()
    );
    if manifest.cancelled {
        println!("Cancelled: yes");
    }
    for result in manifest.failures() {
        println!(
            "  ✗ {} ({}, {}ms)",
            result.design_point,
            result.outcome.kind(),
            result.duration_ms
        );
        if let CapturedStdio::Inline { stderr, .. } = &result.stdio {
            if let Some(last) = stderr.lines().rev().find(|l| !l.trim().is_empty()) {
                println!("      {last}");
            }
        }
    }
    println!("Manifest:  {}", manifest_path.display());
    println!("Status:    {}", if manifest.success { "PASSED" } else { "FAILED" });
}

fn cmd_plan(args: &ConfigArgs, study_id: &str) -> Result<Verdict> {
    let config = resolve_study(args, study_id)?;
    let points = config
        .catalog()
        .enumerate(study_id)
        .with_context(|| format!("cannot enumerate design points of {study_id}"))?;

    let mut planned = 0usize;
    let mut missing = 0usize;
    for point in points {
        match build(&config, &point) {
            Ok(invocation) => {
                planned += 1;
                println!("{point}\t{}", invocation.command_line());
            }
            Err(e) => {
                missing += 1;
                println!("{point}\tSKIP: {e}");
            }
        }
    }
    println!(
        "{} design points, {} runnable, {} missing inputs ({})",
        planned + missing,
        planned,
        missing,
        describe_policy(&config)
    );
    Ok(if missing == 0 {
        Verdict::Success
    } else {
        Verdict::Failed
    })
}

fn cmd_check(args: &ConfigArgs, study_id: Option<&str>) -> Result<Verdict> {
    let raw = args.load()?;
    let study_ids: Vec<String> = match study_id {
        Some(id) => vec![id.to_string()],
        None if raw.studies.is_empty() => {
            anyhow::bail!("no studies declared in the configuration; pass a STUDY_ID to check")
        }
        None => raw.studies.keys().cloned().collect(),
    };

    for id in &study_ids {
        let config =
            resolve(&raw, id).with_context(|| format!("invalid configuration for study {id}"))?;
        let points = config
            .catalog()
            .enumerate(id)
            .with_context(|| format!("cannot enumerate design points of {id}"))?;
        println!("✓ {id}: {} design points", points.count());
        if study_ids.len() == 1 {
            print_config(&config);
        }
    }
    Ok(Verdict::Success)
}

fn print_config(config: &RunConfig) {
    match &config.engine {
        EngineSpec::Jar { runtime, jar, jvm } => {
            println!("  engine:      {} -jar {}", runtime.display(), jar.display());
            println!("  jvm:         {}", jvm.flags().join(" "));
        }
        EngineSpec::Native { executable } => {
            println!("  engine:      {}", executable.display());
        }
    }
    println!("  config:      {}", config.config_dir.display());
    println!("  junctions:   {}", config.junctions_dir.display());
    println!("  inputs:      {}", config.input_dir.display());
    println!("  calibration: {}", config.calibration_dir.display());
    println!("  output:      {}", config.output_dir.display());
    println!("  scheduling:  {}", describe_policy(config));
}

fn describe_policy(config: &RunConfig) -> String {
    let slots = config.execution.policy.slots();
    let timeout = match config.execution.timeout {
        Some(limit) => format!("timeout {}s", limit.as_secs()),
        None => "no timeout".to_string(),
    };
    if slots == 1 {
        format!("serial, {timeout}")
    } else {
        format!("up to {slots} in parallel, {timeout}")
    }
}
