//! Configuration for ledgerflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LEDGERFLOW_HOME, LEDGERFLOW_STORE)
//! 2. Config file (.ledgerflow/config.yaml)
//! 3. Defaults (~/.ledgerflow, file store)
//!
//! Config file discovery:
//! - Searches current directory and parents for .ledgerflow/config.yaml
//! - `paths.home` in the config file is relative to the .ledgerflow/ directory

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{OrchestratorConfig, RetryPolicy};
use crate::worker::WorkerOptions;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
    #[serde(default)]
    pub orchestrator: Option<OrchestratorFileConfig>,
    #[serde(default)]
    pub activity_defaults: Option<ActivityDefaultsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .ledgerflow/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_ms: Option<u64>,
    pub lease_seconds: Option<u64>,
    pub max_concurrent_activities: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorFileConfig {
    pub timer_interval_ms: Option<u64>,
    pub max_append_retries: Option<u32>,
    pub result_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityDefaultsConfig {
    pub start_to_close_timeout_seconds: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Where event histories are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Process memory; lost on exit
    Memory,
    /// JSONL files under `{home}/runs`
    File,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            other => anyhow::bail!("Unknown store '{}' (expected 'memory' or 'file')", other),
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::File => f.write_str("file"),
        }
    }
}

/// Resolved configuration with absolute paths and defaults applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to ledgerflow home (engine state)
    pub home: PathBuf,
    /// Event log backend
    pub store: StoreKind,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub worker: WorkerSettings,
    pub orchestrator: OrchestratorSettings,
    pub activity_defaults: ActivityDefaults,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval_ms: u64,
    pub lease_seconds: u64,
    pub max_concurrent_activities: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            lease_seconds: 60,
            max_concurrent_activities: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub timer_interval_ms: u64,
    pub max_append_retries: u32,
    pub result_poll_interval_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            timer_interval_ms: 100,
            max_append_retries: 8,
            result_poll_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityDefaults {
    pub start_to_close_timeout_seconds: u64,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityDefaults {
    fn default() -> Self {
        Self {
            start_to_close_timeout_seconds: 360,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ResolvedConfig {
    /// Directory holding the file event log
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            lease_duration: Duration::from_secs(self.worker.lease_seconds),
            max_concurrent: self.worker.max_concurrent_activities,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            timer_interval: Duration::from_millis(self.orchestrator.timer_interval_ms),
            max_append_retries: self.orchestrator.max_append_retries,
            result_poll_interval: Duration::from_millis(self.orchestrator.result_poll_interval_ms),
        }
    }

    pub fn start_to_close_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_defaults.start_to_close_timeout_seconds)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".ledgerflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file over the defaults
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    env_home: Option<String>,
    env_store: Option<String>,
) -> Result<ResolvedConfig> {
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env_home {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let store = match env_store.or(file.store) {
        Some(store) => store.parse::<StoreKind>()?,
        None => StoreKind::File,
    };

    let worker_defaults = WorkerSettings::default();
    let worker = match file.worker {
        Some(w) => WorkerSettings {
            poll_interval_ms: w.poll_interval_ms.unwrap_or(worker_defaults.poll_interval_ms),
            lease_seconds: w.lease_seconds.unwrap_or(worker_defaults.lease_seconds),
            max_concurrent_activities: w
                .max_concurrent_activities
                .unwrap_or(worker_defaults.max_concurrent_activities),
        },
        None => worker_defaults,
    };

    let orchestrator_defaults = OrchestratorSettings::default();
    let orchestrator = match file.orchestrator {
        Some(o) => OrchestratorSettings {
            timer_interval_ms: o
                .timer_interval_ms
                .unwrap_or(orchestrator_defaults.timer_interval_ms),
            max_append_retries: o
                .max_append_retries
                .unwrap_or(orchestrator_defaults.max_append_retries),
            result_poll_interval_ms: o
                .result_poll_interval_ms
                .unwrap_or(orchestrator_defaults.result_poll_interval_ms),
        },
        None => orchestrator_defaults,
    };

    let activity_defaults = match file.activity_defaults {
        Some(a) => ActivityDefaults {
            start_to_close_timeout_seconds: a.start_to_close_timeout_seconds.unwrap_or(360),
            retry_policy: a.retry_policy.unwrap_or_default(),
        },
        None => ActivityDefaults::default(),
    };

    Ok(ResolvedConfig {
        home,
        store,
        config_file,
        worker,
        orchestrator,
        activity_defaults,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".ledgerflow");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve(
        file,
        config_file,
        default_home,
        std::env::var("LEDGERFLOW_HOME").ok(),
        std::env::var("LEDGERFLOW_STORE").ok(),
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the ledgerflow home directory (engine state)
pub fn ledgerflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($LEDGERFLOW_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}
