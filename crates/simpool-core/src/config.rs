//! Pool configuration and worker binary discovery.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::DEFAULT_MAX_FRAME_LEN;

/// Environment variable pointing at the worker binary.
pub const WORKER_PATH_ENV: &str = "SIMPOOL_WORKER_PATH";
/// Environment variable overriding the slot count.
pub const WORKERS_ENV: &str = "SIMPOOL_WORKERS";
/// Environment variable overriding the heartbeat interval, in milliseconds.
pub const HEARTBEAT_ENV: &str = "SIMPOOL_HEARTBEAT_MS";

/// Default interval between progress heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

const WORKER_BINARY: &str = if cfg!(windows) {
    "simpool-worker.exe"
} else {
    "simpool-worker"
};

/// Codec a worker speaks on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireProtocol {
    /// Versioned rkyv messages, for Rust peers.
    #[default]
    Object,
    /// Primitive-typed frames, for non-Rust peers.
    Native,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireProtocol::Object => f.write_str("object"),
            WireProtocol::Native => f.write_str("native"),
        }
    }
}

impl FromStr for WireProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "object" => Ok(WireProtocol::Object),
            "native" => Ok(WireProtocol::Native),
            other => Err(Error::Config(format!(
                "unknown protocol {:?}, expected object or native",
                other
            ))),
        }
    }
}

/// Settings for an [`Orchestrator`](crate::orchestrator::Orchestrator) run.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots.
    pub workers: usize,
    /// Cadence of worker progress reports.
    pub heartbeat_interval: Duration,
    /// Explicit worker binary; discovered when `None`.
    pub worker_path: Option<PathBuf>,
    /// Largest frame either side accepts.
    pub max_frame_len: usize,
    /// Start workers with debug logging.
    pub verbose_workers: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            worker_path: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            verbose_workers: false,
        }
    }
}

impl PoolConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(workers) = std::env::var(WORKERS_ENV) {
            config.workers = parse_env(WORKERS_ENV, &workers)?;
        }
        if let Ok(ms) = std::env::var(HEARTBEAT_ENV) {
            config.heartbeat_interval = Duration::from_millis(parse_env(HEARTBEAT_ENV, &ms)?);
        }
        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            config.worker_path = Some(PathBuf::from(path));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn with_max_frame_len(mut self, limit: usize) -> Self {
        self.max_frame_len = limit;
        self
    }

    pub fn with_verbose_workers(mut self, verbose: bool) -> Self {
        self.verbose_workers = verbose;
        self
    }

    /// Reject settings no pool can run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be positive".to_string()));
        }
        if self.max_frame_len == 0 {
            return Err(Error::Config("max frame length must be positive".to_string()));
        }
        Ok(())
    }

    /// Worker binary to launch: the configured path, else discovery.
    pub fn resolve_worker_binary(&self) -> Result<PathBuf> {
        match &self.worker_path {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => Err(Error::Launch(format!(
                "worker binary {} does not exist",
                path.display()
            ))),
            None => find_worker_binary(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| Error::Config(format!("{}={:?}: {}", name, value, e)))
}

/// Find the simpool-worker binary.
///
/// Looks in the following order:
/// 1. `SIMPOOL_WORKER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. `target/debug` or `target/release` of this workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
    {
        let path = exe_dir.join(WORKER_BINARY);
        if path.exists() {
            return Ok(path);
        }
        // Test binaries live one level down, in target/<profile>/deps.
        if let Some(profile_dir) = exe_dir.parent() {
            let path = profile_dir.join(WORKER_BINARY);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    let workspace = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..").join("..");
    for profile in ["debug", "release"] {
        let path = workspace.join("target").join(profile).join(WORKER_BINARY);
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::Launch(format!(
        "could not find {}. Set {} or ensure it's in PATH.",
        WORKER_BINARY, WORKER_PATH_ENV
    )))
}
