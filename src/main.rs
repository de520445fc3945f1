use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use npuprof::config::{Config, StoreKind};
use npuprof::context::PipelineContext;
use npuprof::export::{MemoryRecordStore, RecordStore, SqliteRecordStore};
use npuprof::pipeline::{Pipeline, RunOptions};
use npuprof::source::LocalFileStore;

/// Exit status of a run where some partitions failed but output was written.
const EXIT_PARTIAL: u8 = 2;
/// Exit status of a run that could not start or finish.
const EXIT_FATAL: u8 = 1;

/// Post-processor for NPU profiling data.
#[derive(Parser)]
#[command(name = "npuprof", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Profiling directory to process. Overrides `input_dir`.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory. Overrides `output_dir`.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Worker pool size. Overrides `workers`.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("npuprof {}", version::full());
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_PARTIAL),
        Err(e) => {
            eprintln!("npuprof: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Returns whether every partition succeeded.
fn run(cli: Cli) -> Result<bool> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    apply_overrides(&mut cfg, cli);

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        input = %cfg.input_dir.display(),
        output = %cfg.output_dir.display(),
        workers = cfg.workers,
        "starting npuprof",
    );

    let files = LocalFileStore::new(&cfg.input_dir)?;
    let ctx = PipelineContext::load(&files, cfg.session_pid)?;
    let store = open_store(&cfg)?;
    let pipeline = Pipeline::new(ctx, files, store, cfg.workers, RunOptions::from_config(&cfg));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers)
        .max_blocking_threads(cfg.workers)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let summary = rt.block_on(pipeline.run())?;
    summary.log();

    Ok(summary.success())
}

fn apply_overrides(cfg: &mut Config, cli: Cli) {
    if let Some(input) = cli.input {
        cfg.input_dir = input;
    }
    if let Some(output) = cli.output {
        cfg.output_dir = output;
    }
    if let Some(workers) = cli.workers {
        cfg.workers = workers;
    }
    if let Some(level) = cli.log_level {
        cfg.log_level = level;
    }
}

fn open_store(cfg: &Config) -> Result<Arc<dyn RecordStore>> {
    match cfg.store.kind {
        StoreKind::Sqlite => {
            std::fs::create_dir_all(&cfg.output_dir).with_context(|| {
                format!("creating output directory {}", cfg.output_dir.display())
            })?;
            let store =
                SqliteRecordStore::open_with_timeout(&cfg.store_path(), cfg.store.busy_timeout)?;
            Ok(Arc::new(store))
        }
        StoreKind::Memory => Ok(Arc::new(MemoryRecordStore::new())),
    }
}
