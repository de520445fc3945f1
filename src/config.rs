use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a post-processing run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Collected profiling directory to read.
    #[serde(default)]
    pub input_dir: PathBuf,

    /// Directory receiving the database, trace and metrics files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Size of the worker pool. Default: available parallelism.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Overrides the session id read from the profiling directory.
    #[serde(default)]
    pub session_pid: Option<u32>,

    /// Which domains to process.
    #[serde(default)]
    pub domains: DomainsConfig,

    /// Record store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Trace output configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Metrics output configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Call tree configuration.
    #[serde(default)]
    pub tree: TreeConfig,
}

/// Per-domain toggles. All enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainsConfig {
    #[serde(default = "default_true")]
    pub pcie: bool,
    #[serde(default = "default_true")]
    pub task: bool,
    #[serde(default = "default_true")]
    pub host: bool,
}

/// Which record store backs the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Sqlite,
    Memory,
}

/// Record store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Default: sqlite.
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,

    /// Database file, relative paths resolve against `output_dir`.
    /// Default: "npuprof.db".
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long to wait on a locked database. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,
}

/// Trace output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// File name inside `output_dir`. Default: "trace_view.json".
    #[serde(default = "default_trace_file_name")]
    pub file_name: String,
}

/// Metrics output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus text exposition file written at the end of the run.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

/// Call tree configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TreeConfig {
    /// Warn about threads whose call tree is deeper than this.
    #[serde(default)]
    pub max_depth_warning: Option<u32>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_true() -> bool {
    true
}

fn default_store_kind() -> StoreKind {
    StoreKind::Sqlite
}

fn default_store_path() -> PathBuf {
    PathBuf::from("npuprof.db")
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_trace_file_name() -> String {
    "trace_view.json".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            input_dir: PathBuf::new(),
            output_dir: default_output_dir(),
            workers: default_workers(),
            session_pid: None,
            domains: DomainsConfig::default(),
            store: StoreConfig::default(),
            trace: TraceConfig::default(),
            metrics: MetricsConfig::default(),
            tree: TreeConfig::default(),
        }
    }
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            pcie: true,
            task: true,
            host: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            path: default_store_path(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_name: default_trace_file_name(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Validation is left to the caller
    /// so command line overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.input_dir.as_os_str().is_empty() {
            bail!("input_dir is required");
        }

        if self.output_dir.as_os_str().is_empty() {
            bail!("output_dir is required");
        }

        if self.workers == 0 {
            bail!("workers must be positive");
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!("invalid log_level: {other}"),
        }

        if !self.domains.pcie && !self.domains.task && !self.domains.host {
            bail!("domains: at least one of pcie, task, host must be enabled");
        }

        if self.store.kind == StoreKind::Sqlite && self.store.path.as_os_str().is_empty() {
            bail!("store.path is required when store.kind is sqlite");
        }

        if self.trace.enabled {
            let name = self.trace.file_name.as_str();
            if name.is_empty() {
                bail!("trace.file_name is required when trace.enabled is true");
            }
            if Path::new(name).components().count() != 1 {
                bail!("trace.file_name must be a plain file name: {name}");
            }
        }

        if self.tree.max_depth_warning == Some(0) {
            bail!("tree.max_depth_warning must be positive");
        }

        Ok(())
    }

    /// Database file, resolved against `output_dir`.
    pub fn store_path(&self) -> PathBuf {
        self.output_dir.join(&self.store.path)
    }

    pub fn trace_path(&self) -> PathBuf {
        self.output_dir.join(&self.trace.file_name)
    }
}
